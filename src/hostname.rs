//! Hostname normalisation.
//!
//! A [`Hostname`] is constructed only through [`Hostname::normalize`], so
//! "already normalised" is a type-level invariant rather than a calling
//! convention every call site has to remember.

use std::fmt;

//----------- Hostname -----------------------------------------------------------

/// A normalised DNS label, valid under the control plane's base domain.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Hostname(Box<str>);

impl Hostname {
    /// Normalise a raw, operator- or overlay-network-supplied name.
    ///
    /// Lowercases, folds a small table of accented Latin letters to their
    /// ASCII base, drops every other non-`[a-z0-9-]` byte, collapses runs of
    /// `-`, trims leading/trailing `-`, and truncates to 63 bytes (re-trimming
    /// a trailing `-` left by truncation). Fails if nothing is left.
    pub fn normalize(raw: &str) -> Result<Self, InvalidHostname> {
        let mut out = String::with_capacity(raw.len());
        let mut last_was_hyphen = false;

        for ch in raw.chars() {
            let folded = fold_ascii(ch);
            let Some(folded) = folded else { continue };

            for lower in folded.to_ascii_lowercase().chars() {
                let keep = lower.is_ascii_lowercase() || lower.is_ascii_digit() || lower == '-';
                if !keep {
                    continue;
                }
                if lower == '-' {
                    if last_was_hyphen || out.is_empty() {
                        continue;
                    }
                    last_was_hyphen = true;
                } else {
                    last_was_hyphen = false;
                }
                out.push(lower);
            }
        }

        while out.ends_with('-') {
            out.pop();
        }

        if out.len() > 63 {
            out.truncate(63);
            while out.ends_with('-') {
                out.pop();
            }
        }

        if out.is_empty() {
            return Err(InvalidHostname);
        }

        Ok(Self(out.into_boxed_str()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Append a numeric collision suffix, re-truncating to 63 bytes if the
    /// suffix would overflow the label.
    pub fn with_suffix(&self, n: u16) -> Self {
        let suffix = format!("-{n}");
        let keep = 63usize.saturating_sub(suffix.len());
        let base = if self.0.len() > keep {
            &self.0[..keep]
        } else {
            &self.0[..]
        };
        let base = base.trim_end_matches('-');
        Self(format!("{base}{suffix}").into_boxed_str())
    }

    /// Join this hostname with a base domain to form an FQDN, e.g.
    /// `chat` + `internal` -> `chat.internal`.
    pub fn fqdn(&self, base_domain: &str) -> String {
        format!("{}.{base_domain}", self.0)
    }
}

impl fmt::Display for Hostname {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for Hostname {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

/// Fold a handful of accented Latin letters to their ASCII base; every other
/// character outside ASCII is dropped by the caller's filter, not here.
fn fold_ascii(ch: char) -> Option<String> {
    let folded = match ch {
        'à' | 'á' | 'â' | 'ã' | 'ä' | 'å' | 'À' | 'Á' | 'Â' | 'Ã' | 'Ä' | 'Å' => "a",
        'è' | 'é' | 'ê' | 'ë' | 'È' | 'É' | 'Ê' | 'Ë' => "e",
        'ì' | 'í' | 'î' | 'ï' | 'Ì' | 'Í' | 'Î' | 'Ï' => "i",
        'ò' | 'ó' | 'ô' | 'õ' | 'ö' | 'Ò' | 'Ó' | 'Ô' | 'Õ' | 'Ö' => "o",
        'ù' | 'ú' | 'û' | 'ü' | 'Ù' | 'Ú' | 'Û' | 'Ü' => "u",
        'ñ' | 'Ñ' => "n",
        'ç' | 'Ç' => "c",
        'ý' | 'ÿ' | 'Ý' => "y",
        other if other.is_ascii() => return Some(other.to_string()),
        _ => return None,
    };
    Some(folded.to_string())
}

//----------- InvalidHostname -----------------------------------------------------

/// The normalised form of a name was empty.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct InvalidHostname;

impl fmt::Display for InvalidHostname {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("name contains no characters valid in a DNS label")
    }
}

impl std::error::Error for InvalidHostname {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lowercases_and_strips_invalid_chars() {
        let h = Hostname::normalize("MyDevice_Name@123").unwrap();
        assert_eq!(h.as_str(), "mydevice-name123");
    }

    #[test]
    fn normalising_an_already_normalised_name_is_a_fixpoint() {
        let h = Hostname::normalize("chat").unwrap();
        let h2 = Hostname::normalize(h.as_str()).unwrap();
        assert_eq!(h, h2);
    }

    #[test]
    fn collapses_consecutive_hyphens() {
        let h = Hostname::normalize("foo---bar").unwrap();
        assert_eq!(h.as_str(), "foo-bar");
    }

    #[test]
    fn strips_leading_and_trailing_hyphens() {
        let h = Hostname::normalize("-foo-").unwrap();
        assert_eq!(h.as_str(), "foo");
    }

    #[test]
    fn truncates_long_names_and_strips_trailing_hyphen() {
        let raw = format!("{}-{}", "a".repeat(62), "b");
        let h = Hostname::normalize(&raw).unwrap();
        assert_eq!(h.as_str().len(), 63);
        assert!(!h.as_str().ends_with('-'));
    }

    #[test]
    fn folds_accented_letters() {
        let h = Hostname::normalize("café-élan").unwrap();
        assert_eq!(h.as_str(), "cafe-elan");
    }

    #[test]
    fn empty_after_filtering_is_invalid() {
        assert!(Hostname::normalize("@@@").is_err());
    }

    #[test]
    fn collision_suffix_appends_and_reclaims_space() {
        let h = Hostname::normalize("h").unwrap();
        assert_eq!(h.with_suffix(4).as_str(), "h-4");

        let long = Hostname::normalize(&"a".repeat(63)).unwrap();
        let suffixed = long.with_suffix(999);
        assert_eq!(suffixed.as_str().len(), 63);
        assert!(suffixed.as_str().ends_with("-999"));
    }

    #[test]
    fn fqdn_joins_with_base_domain() {
        let h = Hostname::normalize("chat").unwrap();
        assert_eq!(h.fqdn("internal"), "chat.internal");
    }
}
