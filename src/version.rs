/// Loose dotted-version comparison for installer version strings.
///
/// Only the leading run of numeric components counts ("10.12.4 beta" is
/// 10.12.4). Missing components compare as zero, so "10.12" == "10.12.0".
/// A string with no numeric leading component is unparseable and sorts
/// below every parseable version.
use std::cmp::Ordering;

#[derive(Debug, Clone)]
pub struct LooseVersion {
    components: Option<Vec<u64>>,
}

impl LooseVersion {
    pub fn parse(version: &str) -> Self {
        let mut components = Vec::new();
        for part in version.trim().split('.') {
            let digits: String = part.chars().take_while(|c| c.is_ascii_digit()).collect();
            match digits.parse::<u64>() {
                Ok(n) => components.push(n),
                Err(_) => break,
            }
            // "4b2" contributes 4 and ends the numeric run
            if digits.len() != part.len() {
                break;
            }
        }
        Self {
            components: (!components.is_empty()).then_some(components),
        }
    }
}

impl PartialEq for LooseVersion {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for LooseVersion {}

impl PartialOrd for LooseVersion {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for LooseVersion {
    fn cmp(&self, other: &Self) -> Ordering {
        match (&self.components, &other.components) {
            (None, None) => Ordering::Equal,
            (None, Some(_)) => Ordering::Less,
            (Some(_), None) => Ordering::Greater,
            (Some(a), Some(b)) => {
                let len = a.len().max(b.len());
                for i in 0..len {
                    let x = a.get(i).copied().unwrap_or(0);
                    let y = b.get(i).copied().unwrap_or(0);
                    match x.cmp(&y) {
                        Ordering::Equal => continue,
                        other => return other,
                    }
                }
                Ordering::Equal
            }
        }
    }
}

/// True when `version` sorts strictly below `reference`.
pub fn is_older_than(version: &str, reference: &str) -> bool {
    LooseVersion::parse(version) < LooseVersion::parse(reference)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_patch_release_boundary() {
        assert!(is_older_than("10.12.3", "10.12.4"));
        assert!(!is_older_than("10.12.4", "10.12.4"));
        assert!(!is_older_than("10.13", "10.12.4"));
    }

    #[test]
    fn test_numeric_not_lexical() {
        assert!(is_older_than("10.9.5", "10.12.4"));
        assert!(!is_older_than("10.100", "10.12.4"));
    }

    #[test]
    fn test_missing_components_are_zero() {
        assert_eq!(LooseVersion::parse("10.12"), LooseVersion::parse("10.12.0"));
        assert!(is_older_than("10.12", "10.12.4"));
    }

    #[test]
    fn test_equality_agrees_with_ordering() {
        for (a, b) in [("10.12", "10.12.0"), ("10", "10.0.0"), ("10.12.4", "10.12.4")] {
            let (a, b) = (LooseVersion::parse(a), LooseVersion::parse(b));
            assert_eq!(a.cmp(&b), Ordering::Equal);
            assert_eq!(a, b);
        }
        assert_ne!(LooseVersion::parse("10.12"), LooseVersion::parse("10.12.1"));
    }

    #[test]
    fn test_empty_or_garbage_sorts_lowest() {
        assert!(is_older_than("", "10.12.4"));
        assert!(is_older_than("unknown", "10.12.4"));
        assert_eq!(LooseVersion::parse(""), LooseVersion::parse("n/a"));
    }

    #[test]
    fn test_trailing_text_is_ignored() {
        assert_eq!(
            LooseVersion::parse("10.12.4 beta"),
            LooseVersion::parse("10.12.4")
        );
        assert_eq!(LooseVersion::parse("10.13b2"), LooseVersion::parse("10.13"));
    }
}
