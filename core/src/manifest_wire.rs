//! Binary serialization of the manifest, handed to the agent in one
//! contiguous buffer at process start.
//!
//! ```text
//! magic        "PMAN"
//! version      u32
//! default      u8            // policy for paths not in the trie
//! translations u32 count, then (from_len u32, from, to_len u32, to)
//! trie         u32 root count, then depth-first nodes:
//!              (atom_len u32, atom, policy_bits u16, child_count u32)
//! checksum     crc32 over everything above, little-endian
//! ```
//!
//! A node with no explicit policy encodes `policy_bits` as `0xFFFF`; real
//! policy words never use the high byte. The agent validates magic,
//! version, and checksum before any user code runs.

use bytes::Buf;
use bytes::BufMut;
use bytes::Bytes;
use bytes::BytesMut;
use std::collections::HashMap;

use warden_protocol::WireError;

use crate::canonical::CanonicalPath;
use crate::manifest::Manifest;
use crate::manifest::Node;
use crate::manifest::PolicyBits;
use crate::translate::DirectoryTranslatorBuilder;

pub const MANIFEST_MAGIC: &[u8; 4] = b"PMAN";
pub const MANIFEST_VERSION: u32 = 1;

/// Marker for trie nodes that exist only as ancestors of real entries.
const NO_POLICY: u16 = 0xFFFF;

pub fn encode(manifest: &Manifest) -> Bytes {
    let mut buf = BytesMut::new();
    buf.put_slice(MANIFEST_MAGIC);
    buf.put_u32_le(MANIFEST_VERSION);
    buf.put_u8((manifest.default_policy().bits() & 0xFF) as u8);

    let rules: Vec<_> = manifest.translator().rules().collect();
    buf.put_u32_le(rules.len() as u32);
    for rule in rules {
        put_str(&mut buf, &rule.from);
        put_str(&mut buf, &rule.to);
    }

    let roots = manifest.wire_roots();
    let mut anchors: Vec<&String> = roots.keys().collect();
    anchors.sort();
    buf.put_u32_le(anchors.len() as u32);
    for anchor in anchors {
        encode_node(&mut buf, anchor, &roots[anchor]);
    }

    let checksum = crc32fast::hash(&buf);
    buf.put_u32_le(checksum);
    buf.freeze()
}

fn encode_node(buf: &mut BytesMut, atom: &str, node: &Node) {
    put_str(buf, atom);
    buf.put_u16_le(node.bits.map_or(NO_POLICY, |b| b.bits()));
    let mut atoms: Vec<&String> = node.children.keys().collect();
    atoms.sort();
    buf.put_u32_le(atoms.len() as u32);
    for atom in atoms {
        encode_node(buf, atom, &node.children[atom]);
    }
}

pub fn decode(raw: &[u8]) -> Result<Manifest, WireError> {
    // Checksum first: a corrupt buffer must never be walked.
    if raw.len() < MANIFEST_MAGIC.len() + 4 + 1 + 4 + 4 + 4 {
        return Err(WireError::Truncated {
            context: "manifest buffer",
            needed: 1,
        });
    }
    let (body, footer) = raw.split_at(raw.len() - 4);
    let expected = u32::from_le_bytes([footer[0], footer[1], footer[2], footer[3]]);
    if crc32fast::hash(body) != expected {
        return Err(WireError::Truncated {
            context: "manifest checksum mismatch",
            needed: 0,
        });
    }

    let mut buf = body;
    let mut magic = [0u8; 4];
    buf.copy_to_slice(&mut magic);
    if &magic != MANIFEST_MAGIC {
        return Err(WireError::Truncated {
            context: "manifest magic",
            needed: 0,
        });
    }
    let version = buf.get_u32_le();
    if version != MANIFEST_VERSION {
        return Err(WireError::Truncated {
            context: "unsupported manifest version",
            needed: 0,
        });
    }
    let default_policy = PolicyBits::from_bits_truncate(buf.get_u8() as u16);

    let translation_count = take_u32(&mut buf, "translation count")?;
    let mut translations = DirectoryTranslatorBuilder::new();
    for _ in 0..translation_count {
        let from = take_path(&mut buf, "translation source")?;
        let to = take_path(&mut buf, "translation target")?;
        translations = translations.add(from, to);
    }

    let root_count = take_u32(&mut buf, "trie root count")?;
    let mut roots = HashMap::new();
    for _ in 0..root_count {
        let (anchor, node) = decode_node(&mut buf)?;
        roots.insert(anchor, node);
    }

    Ok(Manifest::from_wire_parts(
        roots,
        default_policy,
        translations.build(),
    ))
}

fn decode_node(buf: &mut &[u8]) -> Result<(String, Node), WireError> {
    let atom = take_str(buf, "trie atom")?;
    if buf.len() < 6 {
        return Err(WireError::Truncated {
            context: "trie node",
            needed: 6 - buf.len(),
        });
    }
    let raw_bits = buf.get_u16_le();
    let bits = if raw_bits == NO_POLICY {
        None
    } else {
        Some(PolicyBits::from_bits_truncate(raw_bits))
    };
    let child_count = buf.get_u32_le();
    let mut children = HashMap::new();
    for _ in 0..child_count {
        let (child_atom, child) = decode_node(buf)?;
        children.insert(child_atom, child);
    }
    Ok((atom, Node { bits, children }))
}

fn put_str(buf: &mut BytesMut, s: &str) {
    buf.put_u32_le(s.len() as u32);
    buf.put_slice(s.as_bytes());
}

fn take_u32(buf: &mut &[u8], context: &'static str) -> Result<u32, WireError> {
    if buf.len() < 4 {
        return Err(WireError::Truncated {
            context,
            needed: 4 - buf.len(),
        });
    }
    Ok(buf.get_u32_le())
}

fn take_str(buf: &mut &[u8], context: &'static str) -> Result<String, WireError> {
    let len = take_u32(buf, context)? as usize;
    if buf.len() < len {
        return Err(WireError::Truncated {
            context,
            needed: len - buf.len(),
        });
    }
    let (head, rest) = buf.split_at(len);
    let s = std::str::from_utf8(head)
        .map_err(|_| WireError::BadUtf8)?
        .to_string();
    *buf = rest;
    Ok(s)
}

fn take_path(buf: &mut &[u8], context: &'static str) -> Result<CanonicalPath, WireError> {
    let s = take_str(buf, context)?;
    CanonicalPath::from_canonical(&s).ok_or(WireError::BadUtf8)
}
