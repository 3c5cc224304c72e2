//! True path to copy path mapping
//!
//! A true path names an object on the host; its copy path names the
//! private copy inside the box. Drive paths land under `drive\<letter>`,
//! UNC paths under `share\<server>\<share>`.

/// Maps a true path to the copy path inside the box
pub trait CopyPathMapper: Send + Sync {
    fn copy_path(&self, true_path: &str) -> Option<String>;
}

/// Strip `prefix` from the start of `path`, case-insensitively and only on a
/// segment boundary. The remainder is empty or starts with `\`.
pub fn strip_box_prefix<'a>(path: &'a str, prefix: &str) -> Option<&'a str> {
    let prefix = prefix.trim_end_matches('\\');
    if prefix.is_empty() || path.len() < prefix.len() || !path.is_char_boundary(prefix.len()) {
        return None;
    }

    let (head, rest) = path.split_at(prefix.len());
    if !head.eq_ignore_ascii_case(prefix) {
        return None;
    }
    if rest.is_empty() || rest.starts_with('\\') {
        Some(rest)
    } else {
        None
    }
}

/// Standard box layout under a virtual box prefix
#[derive(Debug, Clone)]
pub struct BoxPathMapper {
    prefix: String,
}

impl BoxPathMapper {
    pub fn new(prefix: &str) -> Self {
        Self {
            prefix: prefix.trim_end_matches('\\').to_string(),
        }
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    /// Reverse mapping, for paths that already live inside the box
    pub fn true_path(&self, copy_path: &str) -> Option<String> {
        let rest = strip_box_prefix(copy_path, &self.prefix)?;
        let mut segments = rest.split('\\').filter(|s| !s.is_empty());

        match segments.next() {
            Some(kind) if kind.eq_ignore_ascii_case("drive") => {
                let letter = segments.next()?;
                let tail: Vec<&str> = segments.collect();
                Some(format!("{}:\\{}", letter, tail.join("\\")))
            }
            Some(kind) if kind.eq_ignore_ascii_case("share") => {
                let tail: Vec<&str> = segments.collect();
                Some(format!("\\\\{}", tail.join("\\")))
            }
            _ => Some(if rest.is_empty() { "\\".to_string() } else { rest.to_string() }),
        }
    }
}

impl CopyPathMapper for BoxPathMapper {
    fn copy_path(&self, true_path: &str) -> Option<String> {
        if true_path.is_empty() {
            return None;
        }
        if strip_box_prefix(true_path, &self.prefix).is_some() {
            return Some(true_path.to_string());
        }

        let bytes = true_path.as_bytes();
        if bytes.len() >= 2 && bytes[0].is_ascii_alphabetic() && bytes[1] == b':' {
            let rest = true_path[2..].trim_start_matches('\\');
            let mut out = format!("{}\\drive\\{}", self.prefix, &true_path[..1]);
            if !rest.is_empty() {
                out.push('\\');
                out.push_str(rest);
            }
            return Some(out);
        }

        if let Some(unc) = true_path.strip_prefix("\\\\") {
            return Some(format!("{}\\share\\{}", self.prefix, unc));
        }

        Some(format!(
            "{}\\{}",
            self.prefix,
            true_path.trim_start_matches('\\')
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    const PREFIX: &str = r"C:\Sandbox\alice\DefaultBox";

    #[test]
    fn test_strip_prefix_on_boundary() {
        assert_eq!(strip_box_prefix(r"c:\sandbox\ALICE\defaultbox\drive\C", PREFIX), Some(r"\drive\C"));
        assert_eq!(strip_box_prefix(PREFIX, PREFIX), Some(""));
        assert_eq!(strip_box_prefix(r"C:\Sandbox\alice\DefaultBox2\x", PREFIX), None);
        assert_eq!(strip_box_prefix(r"C:\Other", PREFIX), None);
    }

    #[test]
    fn test_copy_path_layout() {
        let mapper = BoxPathMapper::new(PREFIX);
        assert_eq!(
            mapper.copy_path(r"D:\Users\bob\a.txt").unwrap(),
            format!(r"{PREFIX}\drive\D\Users\bob\a.txt")
        );
        assert_eq!(mapper.copy_path(r"D:\").unwrap(), format!(r"{PREFIX}\drive\D"));
        assert_eq!(
            mapper.copy_path(r"\\server\share\doc").unwrap(),
            format!(r"{PREFIX}\share\server\share\doc")
        );
        assert_eq!(
            mapper.copy_path(r"\REGISTRY\USER\S-1").unwrap(),
            format!(r"{PREFIX}\REGISTRY\USER\S-1")
        );
        assert_eq!(mapper.copy_path(""), None);
    }

    #[test]
    fn test_true_path_reverses_copy_path() {
        let mapper = BoxPathMapper::new(PREFIX);
        for path in [r"D:\Users\bob\a.txt", r"\\server\share\doc", r"\REGISTRY\MACHINE"] {
            let copy = mapper.copy_path(path).unwrap();
            assert_eq!(mapper.true_path(&copy).as_deref(), Some(path));
        }
    }
}
