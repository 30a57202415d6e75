//! Structural validation of git bundle headers.
//!
//! Format (see `gitformat-bundle(5)`):
//!
//! ```text
//! # v3 git bundle
//! @object-format=sha1
//! -<prerequisite oid> <comment>
//! <oid> refs/heads/main
//! <oid> HEAD
//!
//! PACK....
//! ```
//!
//! The capability lines only exist in v3.  The header ends at the first empty
//! line and a packfile follows immediately.

use std::collections::BTreeMap;

const V2_SIGNATURE: &str = "# v2 git bundle";
const V3_SIGNATURE: &str = "# v3 git bundle";
const PACK_MAGIC: &[u8] = b"PACK";

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum HeaderError {
    #[error("missing git bundle signature")]
    BadSignature,

    #[error("bundle header is not terminated by an empty line")]
    Unterminated,

    #[error("bundle header line {line}: {reason}")]
    InvalidLine { line: usize, reason: String },

    #[error("unsupported object format {0:?}")]
    UnsupportedObjectFormat(String),

    #[error("bundle advertises no refs")]
    NoRefs,

    #[error("bundle header is not followed by a packfile")]
    MissingPack,
}

/// Parsed bundle header.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BundleHeader {
    pub version: u8,
    pub capabilities: BTreeMap<String, String>,
    pub prerequisites: Vec<String>,
    /// refname -> object id.  Includes `HEAD` when the producer bundled it.
    pub refs: BTreeMap<String, String>,
}

impl BundleHeader {
    /// Refs that can be pushed (everything except `HEAD`).
    pub fn pushable_refs(&self) -> impl Iterator<Item = (&str, &str)> {
        self.refs
            .iter()
            .filter(|(name, _)| name.as_str() != "HEAD")
            .map(|(name, oid)| (name.as_str(), oid.as_str()))
    }

    /// Branch that the bundled `HEAD` points at.
    ///
    /// A bundle records `HEAD` by object id only, so the branch is the one
    /// sharing that id; `main` then `master` win ties, then the first by name.
    pub fn head_branch(&self) -> Option<&str> {
        let head = self.refs.get("HEAD")?;
        let candidates: Vec<&str> = self
            .refs
            .iter()
            .filter(|(name, oid)| name.starts_with("refs/heads/") && *oid == head)
            .map(|(name, _)| name.as_str())
            .collect();
        ["refs/heads/main", "refs/heads/master"]
            .into_iter()
            .find(|preferred| candidates.contains(preferred))
            .or_else(|| candidates.first().copied())
            .map(|r| r.trim_start_matches("refs/heads/"))
    }

    fn oid_len(&self) -> usize {
        match self.capabilities.get("object-format").map(String::as_str) {
            Some("sha256") => 64,
            _ => 40,
        }
    }
}

/// Parse and validate the header at the start of `data`.
pub fn parse_header(data: &[u8]) -> Result<BundleHeader, HeaderError> {
    let mut lines = HeaderLines { data, pos: 0, line: 0 };

    let version = match lines.next_line() {
        Some(Ok(V2_SIGNATURE)) => 2,
        Some(Ok(V3_SIGNATURE)) => 3,
        _ => return Err(HeaderError::BadSignature),
    };

    let mut header = BundleHeader {
        version,
        capabilities: BTreeMap::new(),
        prerequisites: Vec::new(),
        refs: BTreeMap::new(),
    };

    let mut terminated = false;
    let mut seen_ref_or_prereq = false;
    while let Some(line) = lines.next_line() {
        let line = line?;
        if line.is_empty() {
            terminated = true;
            break;
        }
        let line_no = lines.line;
        let invalid = |reason: &str| HeaderError::InvalidLine {
            line: line_no,
            reason: reason.to_string(),
        };

        if let Some(cap) = line.strip_prefix('@') {
            if header.version < 3 {
                return Err(invalid("capabilities require a v3 bundle"));
            }
            if seen_ref_or_prereq {
                return Err(invalid("capability after refs"));
            }
            let (k, v) = cap.split_once('=').unwrap_or((cap, ""));
            if k.is_empty() {
                return Err(invalid("empty capability name"));
            }
            if k == "object-format" && !matches!(v, "sha1" | "sha256") {
                return Err(HeaderError::UnsupportedObjectFormat(v.to_string()));
            }
            header.capabilities.insert(k.to_string(), v.to_string());
            continue;
        }

        seen_ref_or_prereq = true;
        if let Some(prereq) = line.strip_prefix('-') {
            let oid = prereq.split(' ').next().unwrap_or("");
            if !is_oid(oid, header.oid_len()) {
                return Err(invalid("malformed prerequisite object id"));
            }
            header.prerequisites.push(oid.to_ascii_lowercase());
            continue;
        }

        let (oid, refname) = line
            .split_once(' ')
            .ok_or_else(|| invalid("expected `<oid> <refname>`"))?;
        if !is_oid(oid, header.oid_len()) {
            return Err(invalid("malformed object id"));
        }
        if !is_refname(refname) {
            return Err(invalid("malformed ref name"));
        }
        if header
            .refs
            .insert(refname.to_string(), oid.to_ascii_lowercase())
            .is_some()
        {
            return Err(invalid("duplicate ref"));
        }
    }

    if !terminated {
        return Err(HeaderError::Unterminated);
    }
    if header.pushable_refs().next().is_none() {
        return Err(HeaderError::NoRefs);
    }
    if !data[lines.pos..].starts_with(PACK_MAGIC) {
        return Err(HeaderError::MissingPack);
    }
    Ok(header)
}

/// Newline-terminated header lines; a trailing fragment without `\n` is not
/// a line.
struct HeaderLines<'a> {
    data: &'a [u8],
    pos: usize,
    line: usize,
}

impl<'a> HeaderLines<'a> {
    fn next_line(&mut self) -> Option<Result<&'a str, HeaderError>> {
        let rest = self.data.get(self.pos..)?;
        let end = rest.iter().position(|b| *b == b'\n')?;
        self.pos += end + 1;
        self.line += 1;
        let line = self.line;
        Some(
            std::str::from_utf8(&rest[..end])
                .map(|s| s.strip_suffix('\r').unwrap_or(s))
                .map_err(|_| HeaderError::InvalidLine {
                    line,
                    reason: "not valid UTF-8".to_string(),
                }),
        )
    }
}

fn is_oid(s: &str, len: usize) -> bool {
    s.len() == len && s.bytes().all(|b| b.is_ascii_hexdigit())
}

fn is_refname(name: &str) -> bool {
    if name == "HEAD" {
        return true;
    }
    name.starts_with("refs/")
        && !name.ends_with('/')
        && !name.ends_with(".lock")
        && !name.contains("..")
        && !name.contains("//")
        && !name.contains("@{")
        && !name
            .chars()
            .any(|c| c.is_ascii_control() || matches!(c, ' ' | '~' | '^' | ':' | '?' | '*' | '[' | '\\'))
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    pub(crate) const OID_A: &str = "1111111111111111111111111111111111111111";
    pub(crate) const OID_B: &str = "2222222222222222222222222222222222222222";

    /// A structurally valid bundle advertising `refs`.
    pub(crate) fn bundle_bytes(refs: &[(&str, &str)]) -> Vec<u8> {
        let mut out = String::from("# v2 git bundle\n");
        for (oid, name) in refs {
            out.push_str(&format!("{oid} {name}\n"));
        }
        out.push('\n');
        let mut bytes = out.into_bytes();
        bytes.extend_from_slice(b"PACK\x00\x00\x00\x02\x00\x00\x00\x00");
        bytes
    }

    #[test]
    fn parses_v2_bundle() {
        let data = bundle_bytes(&[(OID_A, "refs/heads/main"), (OID_A, "HEAD"), (OID_B, "refs/tags/v1")]);
        let header = parse_header(&data).unwrap();
        assert_eq!(header.version, 2);
        assert_eq!(header.refs.len(), 3);
        assert_eq!(header.pushable_refs().count(), 2);
        assert_eq!(header.head_branch(), Some("main"));
    }

    #[test]
    fn parses_v3_with_capabilities_and_prerequisites() {
        let mut data = format!(
            "# v3 git bundle\n@object-format=sha1\n@filter=blob:none\n-{OID_B} parent commit\n{OID_A} refs/heads/dev\n\n"
        )
        .into_bytes();
        data.extend_from_slice(b"PACK");
        let header = parse_header(&data).unwrap();
        assert_eq!(header.version, 3);
        assert_eq!(header.capabilities.get("filter").map(String::as_str), Some("blob:none"));
        assert_eq!(header.prerequisites, vec![OID_B.to_string()]);
        assert_eq!(header.head_branch(), None);
    }

    #[test]
    fn sha256_object_ids() {
        let oid = "a".repeat(64);
        let mut data =
            format!("# v3 git bundle\n@object-format=sha256\n{oid} refs/heads/main\n\n").into_bytes();
        data.extend_from_slice(b"PACK");
        assert!(parse_header(&data).is_ok());

        let mut short = format!("# v3 git bundle\n@object-format=sha256\n{OID_A} refs/heads/main\n\n")
            .into_bytes();
        short.extend_from_slice(b"PACK");
        assert!(matches!(parse_header(&short), Err(HeaderError::InvalidLine { line: 3, .. })));
    }

    #[test]
    fn head_branch_prefers_main_on_tie() {
        let data = bundle_bytes(&[
            (OID_A, "HEAD"),
            (OID_A, "refs/heads/alpha"),
            (OID_A, "refs/heads/main"),
        ]);
        assert_eq!(parse_header(&data).unwrap().head_branch(), Some("main"));
    }

    #[test]
    fn rejects_structural_problems() {
        let cases: Vec<(Vec<u8>, fn(&HeaderError) -> bool)> = vec![
            (b"garbage".to_vec(), |e| matches!(e, HeaderError::BadSignature)),
            (b"# v4 git bundle\n\nPACK".to_vec(), |e| matches!(e, HeaderError::BadSignature)),
            (
                format!("# v2 git bundle\n{OID_A} refs/heads/main\n").into_bytes(),
                |e| matches!(e, HeaderError::Unterminated),
            ),
            (
                format!("# v2 git bundle\n{OID_A} HEAD\n\nPACK").into_bytes(),
                |e| matches!(e, HeaderError::NoRefs),
            ),
            (
                format!("# v2 git bundle\n{OID_A} refs/heads/main\n\nNOTAPACK").into_bytes(),
                |e| matches!(e, HeaderError::MissingPack),
            ),
            (
                format!("# v2 git bundle\nzzzz refs/heads/main\n\nPACK").into_bytes(),
                |e| matches!(e, HeaderError::InvalidLine { line: 2, .. }),
            ),
            (
                format!("# v2 git bundle\n{OID_A} refs/heads/../main\n\nPACK").into_bytes(),
                |e| matches!(e, HeaderError::InvalidLine { .. }),
            ),
            (
                format!("# v2 git bundle\n@object-format=sha1\n{OID_A} refs/heads/main\n\nPACK")
                    .into_bytes(),
                |e| matches!(e, HeaderError::InvalidLine { line: 2, .. }),
            ),
            (
                format!("# v2 git bundle\n{OID_A} refs/heads/main\n{OID_B} refs/heads/main\n\nPACK")
                    .into_bytes(),
                |e| matches!(e, HeaderError::InvalidLine { line: 3, .. }),
            ),
            (
                format!("# v3 git bundle\n@object-format=md5\n{OID_A} refs/heads/main\n\nPACK")
                    .into_bytes(),
                |e| matches!(e, HeaderError::UnsupportedObjectFormat(_)),
            ),
        ];
        for (data, check) in cases {
            let err = parse_header(&data).unwrap_err();
            assert!(check(&err), "{:?} -> {err:?}", String::from_utf8_lossy(&data));
        }
    }
}
