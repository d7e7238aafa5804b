//! Netlink attribute (nlattr) handling.
//!
//! Attributes arrive as a flat type-length-value stream. [`AttrTree`]
//! indexes one stream against a declared [`Policy`] so callers get
//! bounds-checked, width-verified typed values instead of reinterpreting
//! raw kernel bytes.

use super::error::{Error, Result};
use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout};

/// Netlink attribute alignment.
pub const NLA_ALIGNTO: usize = 4;

/// Align a length to NLA_ALIGNTO boundary.
#[inline]
pub const fn nla_align(len: usize) -> usize {
    (len + NLA_ALIGNTO - 1) & !(NLA_ALIGNTO - 1)
}

/// Size of the attribute header.
pub const NLA_HDRLEN: usize = 4; // nla_align(size_of::<NlAttr>())

/// Netlink attribute header (mirrors struct nlattr).
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, FromBytes, IntoBytes, Immutable, KnownLayout)]
pub struct NlAttr {
    /// Length including header.
    pub nla_len: u16,
    /// Attribute type.
    pub nla_type: u16,
}

/// Attribute type flags.
pub const NLA_F_NESTED: u16 = 1 << 15;
pub const NLA_F_NET_BYTEORDER: u16 = 1 << 14;
pub const NLA_TYPE_MASK: u16 = !(NLA_F_NESTED | NLA_F_NET_BYTEORDER);

impl NlAttr {
    /// Create a new attribute header.
    pub fn new(attr_type: u16, data_len: usize) -> Self {
        Self {
            nla_len: (NLA_HDRLEN + data_len) as u16,
            nla_type: attr_type,
        }
    }

    /// Get the attribute type without flags.
    pub fn kind(&self) -> u16 {
        self.nla_type & NLA_TYPE_MASK
    }

    /// Get the payload length (total length minus header).
    pub fn payload_len(&self) -> usize {
        (self.nla_len as usize).saturating_sub(NLA_HDRLEN)
    }

    /// Convert to bytes.
    pub fn as_bytes(&self) -> &[u8] {
        <Self as IntoBytes>::as_bytes(self)
    }

    /// Parse from bytes.
    pub fn from_bytes(data: &[u8]) -> Result<&Self> {
        Self::ref_from_prefix(data)
            .map(|(r, _)| r)
            .map_err(|_| Error::Truncated {
                expected: std::mem::size_of::<Self>(),
                actual: data.len(),
            })
    }
}

/// Expected encoding of one attribute type within a [`Policy`].
#[derive(Debug, Clone, Copy)]
pub enum AttrKind {
    /// Padding or reserved slot; payload ignored.
    Unspec,
    /// Exactly 1 byte.
    U8,
    /// Exactly 2 bytes, native endian.
    U16,
    /// Exactly 4 bytes, native endian.
    U32,
    /// Exactly 8 bytes, native endian.
    U64,
    /// NUL-terminated string, bounded by the given maximum payload length.
    String(usize),
    /// Opaque bytes, any length.
    Binary,
    /// Sub-stream decoded recursively against the narrower policy.
    Nested(&'static Policy),
}

impl AttrKind {
    fn name(&self) -> &'static str {
        match self {
            AttrKind::Unspec => "unspec",
            AttrKind::U8 => "u8 (1 byte)",
            AttrKind::U16 => "u16 (2 bytes)",
            AttrKind::U32 => "u32 (4 bytes)",
            AttrKind::U64 => "u64 (8 bytes)",
            AttrKind::String(_) => "NUL-terminated string",
            AttrKind::Binary => "binary",
            AttrKind::Nested(_) => "nested",
        }
    }
}

/// Per-message attribute policy: the expected kind for every type code
/// up to the declared maximum.
#[derive(Debug)]
pub struct Policy {
    /// Policy name, used in diagnostics.
    pub name: &'static str,
    /// Kind table indexed by attribute type code.
    pub kinds: &'static [AttrKind],
}

impl Policy {
    fn kind(&self, ty: u16) -> Option<&AttrKind> {
        self.kinds.get(ty as usize)
    }
}

/// Iterator over raw attributes in a buffer.
///
/// Unlike [`AttrTree`], this applies no policy; the item is
/// (type code without flags, payload bytes). Iteration stops at the
/// first attribute that does not fit the buffer;
/// [`remaining`](Self::remaining) exposes the unconsumed bytes so the
/// caller can tell a clean end from a malformed tail.
pub struct AttrIter<'a> {
    data: &'a [u8],
}

impl<'a> AttrIter<'a> {
    /// Create a new attribute iterator.
    pub fn new(data: &'a [u8]) -> Self {
        Self { data }
    }

    /// Bytes not consumed by the walk. Empty after a clean end.
    pub fn remaining(&self) -> &'a [u8] {
        self.data
    }
}

impl<'a> Iterator for AttrIter<'a> {
    type Item = (u16, &'a [u8]);

    fn next(&mut self) -> Option<Self::Item> {
        if self.data.len() < NLA_HDRLEN {
            return None;
        }

        let attr = match NlAttr::from_bytes(self.data) {
            Ok(a) => a,
            Err(_) => return None,
        };

        let len = attr.nla_len as usize;
        if len < NLA_HDRLEN || len > self.data.len() {
            return None;
        }

        let payload = &self.data[NLA_HDRLEN..len];
        let aligned_len = nla_align(len);

        // Move to next attribute
        if aligned_len >= self.data.len() {
            self.data = &[];
        } else {
            self.data = &self.data[aligned_len..];
        }

        Some((attr.kind(), payload))
    }
}

/// One decoded attribute stream, indexed by type code and validated
/// against a [`Policy`].
pub struct AttrTree<'a> {
    policy: &'static Policy,
    slots: Vec<Option<&'a [u8]>>,
    deficit: usize,
}

impl<'a> AttrTree<'a> {
    /// Decode a flat attribute buffer against `policy`.
    ///
    /// An attribute whose declared length overruns the buffer is a
    /// structural error. Type codes above the policy maximum are
    /// skipped; the first occurrence of a duplicated type wins.
    /// Leftover bytes too short to form a header are a kernel-side bug
    /// signal; they are counted as a deficit but the decoded tree is
    /// still returned.
    pub fn parse(data: &'a [u8], policy: &'static Policy) -> Result<Self> {
        let mut slots = vec![None; policy.kinds.len()];
        let mut iter = AttrIter::new(data);

        for (ty, payload) in iter.by_ref() {
            let ty = ty as usize;
            if ty < slots.len() && slots[ty].is_none() {
                slots[ty] = Some(payload);
            }
        }

        // The walk stops early at an attribute whose declared length
        // does not fit the buffer; anything shorter than a header is a
        // trailing deficit instead.
        let rest = iter.remaining();
        if rest.len() >= NLA_HDRLEN {
            let attr = NlAttr::from_bytes(rest)?;
            return Err(Error::InvalidAttribute(format!(
                "{}: attribute type {} declares {} bytes, {} remain",
                policy.name,
                attr.kind(),
                attr.nla_len,
                rest.len()
            )));
        }

        let deficit = rest.len();
        if deficit != 0 {
            tracing::warn!(
                policy = policy.name,
                deficit,
                "trailing bytes do not form a complete attribute header"
            );
        }

        Ok(Self {
            policy,
            slots,
            deficit,
        })
    }

    /// The policy this tree was decoded against.
    pub fn policy(&self) -> &'static Policy {
        self.policy
    }

    /// Number of trailing bytes that did not form a complete header.
    /// Non-zero indicates a kernel-side encoding bug; the rest of the
    /// tree remains usable.
    pub fn deficit(&self) -> usize {
        self.deficit
    }

    /// Raw payload of an attribute, if present.
    pub fn get(&self, ty: u16) -> Option<&'a [u8]> {
        self.slots.get(ty as usize).copied().flatten()
    }

    /// Check presence without interpreting the payload.
    pub fn contains(&self, ty: u16) -> bool {
        self.get(ty).is_some()
    }

    fn checked(&self, ty: u16, expected: &'static str, width: usize) -> Result<Option<&'a [u8]>> {
        let Some(payload) = self.get(ty) else {
            return Ok(None);
        };
        if payload.len() != width {
            return Err(Error::AttributeMismatch {
                attr: ty,
                expected,
                found: format!("{} bytes", payload.len()),
            });
        }
        match self.policy.kind(ty) {
            Some(k) if matches_width(k, width) => Ok(Some(payload)),
            Some(k) => Err(Error::AttributeMismatch {
                attr: ty,
                expected,
                found: k.name().into(),
            }),
            None => Ok(Some(payload)),
        }
    }

    /// Extract a u8 value.
    pub fn get_u8(&self, ty: u16) -> Result<Option<u8>> {
        Ok(self.checked(ty, "u8 (1 byte)", 1)?.map(|p| p[0]))
    }

    /// Extract a u16 value (native endian).
    pub fn get_u16(&self, ty: u16) -> Result<Option<u16>> {
        Ok(self
            .checked(ty, "u16 (2 bytes)", 2)?
            .map(|p| u16::from_ne_bytes([p[0], p[1]])))
    }

    /// Extract a u32 value (native endian).
    pub fn get_u32(&self, ty: u16) -> Result<Option<u32>> {
        Ok(self
            .checked(ty, "u32 (4 bytes)", 4)?
            .map(|p| u32::from_ne_bytes([p[0], p[1], p[2], p[3]])))
    }

    /// Extract a u64 value (native endian).
    pub fn get_u64(&self, ty: u16) -> Result<Option<u64>> {
        Ok(self.checked(ty, "u64 (8 bytes)", 8)?.map(|p| {
            u64::from_ne_bytes([p[0], p[1], p[2], p[3], p[4], p[5], p[6], p[7]])
        }))
    }

    /// Extract an unsigned counter that the kernel may encode as either
    /// u32 or u64 depending on its version. The declared kind must be
    /// an integer; a string or binary attribute is not reinterpreted.
    pub fn get_uint(&self, ty: u16) -> Result<Option<u64>> {
        let Some(payload) = self.get(ty) else {
            return Ok(None);
        };
        match self.policy.kind(ty) {
            Some(AttrKind::U32 | AttrKind::U64) | None => {}
            Some(k) => {
                return Err(Error::AttributeMismatch {
                    attr: ty,
                    expected: "u32 or u64",
                    found: k.name().into(),
                });
            }
        }
        match payload.len() {
            4 => Ok(Some(
                u32::from_ne_bytes([payload[0], payload[1], payload[2], payload[3]]) as u64,
            )),
            8 => Ok(Some(u64::from_ne_bytes([
                payload[0], payload[1], payload[2], payload[3], payload[4], payload[5],
                payload[6], payload[7],
            ]))),
            n => Err(Error::AttributeMismatch {
                attr: ty,
                expected: "u32 or u64",
                found: format!("{} bytes", n),
            }),
        }
    }

    /// Extract a NUL-terminated string, bounded by the policy maximum.
    pub fn get_string(&self, ty: u16) -> Result<Option<&'a str>> {
        let Some(payload) = self.get(ty) else {
            return Ok(None);
        };
        let max = match self.policy.kind(ty) {
            Some(AttrKind::String(max)) => *max,
            Some(k) => {
                return Err(Error::AttributeMismatch {
                    attr: ty,
                    expected: "NUL-terminated string",
                    found: k.name().into(),
                });
            }
            None => payload.len(),
        };
        if payload.len() > max + 1 {
            return Err(Error::AttributeMismatch {
                attr: ty,
                expected: "NUL-terminated string",
                found: format!("{} bytes (max {})", payload.len(), max),
            });
        }
        let len = payload.iter().position(|&b| b == 0).unwrap_or(payload.len());
        let s = std::str::from_utf8(&payload[..len])
            .map_err(|e| Error::InvalidAttribute(format!("invalid UTF-8: {}", e)))?;
        Ok(Some(s))
    }

    /// Decode a nested attribute recursively against the policy the
    /// parent declares for it.
    pub fn nested(&self, ty: u16) -> Result<Option<AttrTree<'a>>> {
        let Some(payload) = self.get(ty) else {
            return Ok(None);
        };
        match self.policy.kind(ty) {
            Some(AttrKind::Nested(sub)) => Ok(Some(AttrTree::parse(payload, sub)?)),
            Some(k) => Err(Error::AttributeMismatch {
                attr: ty,
                expected: "nested",
                found: k.name().into(),
            }),
            None => Err(Error::AttributeMismatch {
                attr: ty,
                expected: "nested",
                found: "undeclared type".into(),
            }),
        }
    }
}

fn matches_width(kind: &AttrKind, width: usize) -> bool {
    matches!(
        (kind, width),
        (AttrKind::U8, 1)
            | (AttrKind::U16, 2)
            | (AttrKind::U32, 4)
            | (AttrKind::U64, 8)
            | (AttrKind::Unspec, _)
            | (AttrKind::Binary, _)
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::netlink::builder::MessageBuilder;
    use crate::netlink::message::{NLM_F_REQUEST, NLMSG_HDRLEN};

    static INNER: Policy = Policy {
        name: "inner",
        kinds: &[AttrKind::Unspec, AttrKind::U64],
    };

    static OUTER: Policy = Policy {
        name: "outer",
        kinds: &[
            AttrKind::Unspec,
            AttrKind::U8,
            AttrKind::U32,
            AttrKind::U64,
            AttrKind::String(16),
            AttrKind::Nested(&INNER),
        ],
    };

    fn attr_bytes(build: impl FnOnce(&mut MessageBuilder)) -> Vec<u8> {
        let mut builder = MessageBuilder::new(20, NLM_F_REQUEST);
        build(&mut builder);
        builder.finish()[NLMSG_HDRLEN..].to_vec()
    }

    #[test]
    fn test_roundtrip() {
        let buf = attr_bytes(|b| {
            b.append_attr_u8(1, 7);
            b.append_attr_u32(2, 0xdeadbeef);
            b.append_attr_u64(3, u64::MAX - 1);
            b.append_attr_str(4, "eth0");
            let nest = b.nest_start(5);
            b.append_attr_u64(1, 42);
            b.nest_end(nest);
        });

        let tree = AttrTree::parse(&buf, &OUTER).unwrap();
        assert_eq!(tree.get_u8(1).unwrap(), Some(7));
        assert_eq!(tree.get_u32(2).unwrap(), Some(0xdeadbeef));
        assert_eq!(tree.get_u64(3).unwrap(), Some(u64::MAX - 1));
        assert_eq!(tree.get_string(4).unwrap(), Some("eth0"));
        let inner = tree.nested(5).unwrap().unwrap();
        assert_eq!(inner.get_u64(1).unwrap(), Some(42));
        assert_eq!(tree.deficit(), 0);
    }

    #[test]
    fn test_duplicate_keeps_first() {
        let buf = attr_bytes(|b| {
            b.append_attr_u32(2, 1);
            b.append_attr_u32(2, 2);
        });
        let tree = AttrTree::parse(&buf, &OUTER).unwrap();
        assert_eq!(tree.get_u32(2).unwrap(), Some(1));
    }

    #[test]
    fn test_unknown_type_skipped() {
        let buf = attr_bytes(|b| {
            b.append_attr_u32(99, 5);
            b.append_attr_u8(1, 3);
        });
        let tree = AttrTree::parse(&buf, &OUTER).unwrap();
        assert!(!tree.contains(99));
        assert_eq!(tree.get_u8(1).unwrap(), Some(3));
    }

    #[test]
    fn test_overrun_is_structural_error() {
        let mut buf = attr_bytes(|b| b.append_attr_u32(2, 0));
        // Inflate the declared length past the end of the buffer.
        buf[0] = 0xff;
        assert!(AttrTree::parse(&buf, &OUTER).is_err());
    }

    #[test]
    fn test_deficit_is_nonfatal() {
        let mut buf = attr_bytes(|b| b.append_attr_u8(1, 9));
        buf.extend_from_slice(&[0xaa, 0xbb]); // dangling partial header
        let tree = AttrTree::parse(&buf, &OUTER).unwrap();
        assert_eq!(tree.deficit(), 2);
        assert_eq!(tree.get_u8(1).unwrap(), Some(9));
    }

    #[test]
    fn test_accessor_width_mismatch() {
        let buf = attr_bytes(|b| b.append_attr_u32(3, 1)); // u64 slot, 4 bytes
        let tree = AttrTree::parse(&buf, &OUTER).unwrap();
        assert!(matches!(
            tree.get_u64(3),
            Err(Error::AttributeMismatch { attr: 3, .. })
        ));
        // get_uint tolerates the narrow encoding
        assert_eq!(tree.get_uint(3).unwrap(), Some(1));
    }

    #[test]
    fn test_accessor_kind_mismatch() {
        let buf = attr_bytes(|b| b.append_attr(4, &[b'x', 0, 0, 0, 0, 0, 0, 0]));
        let tree = AttrTree::parse(&buf, &OUTER).unwrap();
        // type 4 is declared String; reading it as u64 must fail loudly
        assert!(tree.get_u64(4).is_err());
    }

    #[test]
    fn test_raw_iter_yields_all_attributes() {
        let buf = attr_bytes(|b| {
            b.append_attr_u8(1, 7);
            b.append_attr_u32(99, 5); // no policy applies to the raw walk
        });
        let items: Vec<_> = AttrIter::new(&buf).collect();
        assert_eq!(items.len(), 2);
        assert_eq!(items[0], (1, &[7u8][..]));
        assert_eq!(items[1].0, 99);
        assert_eq!(items[1].1.len(), 4);
    }

    #[test]
    fn test_raw_iter_stops_at_overrun() {
        let mut buf = attr_bytes(|b| b.append_attr_u32(2, 0));
        buf[0] = 0xff; // declared length past the end of the buffer
        let mut iter = AttrIter::new(&buf);
        assert!(iter.next().is_none());
        assert_eq!(iter.remaining().len(), buf.len());
    }

    #[test]
    fn test_uint_requires_integer_kind() {
        // type 4 is declared String; its 4-byte payload must not be
        // reinterpreted as a counter
        let buf = attr_bytes(|b| b.append_attr(4, &[b'e', b't', b'h', 0]));
        let tree = AttrTree::parse(&buf, &OUTER).unwrap();
        assert!(matches!(
            tree.get_uint(4),
            Err(Error::AttributeMismatch { attr: 4, .. })
        ));
    }

    #[test]
    fn test_nested_on_scalar_fails() {
        let buf = attr_bytes(|b| b.append_attr_u8(1, 1));
        let tree = AttrTree::parse(&buf, &OUTER).unwrap();
        assert!(tree.nested(1).is_err());
    }
}
