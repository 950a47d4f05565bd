use serde::{Deserialize, Serialize};

pub const MASK_CHAR: char = '*';

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "style", rename_all = "kebab-case")]
pub enum MaskStyle {
    /// Every character replaced.
    Full,
    /// Keep a prefix and/or suffix, mask the middle. Values too short to keep
    /// anything hidden are masked in full.
    #[serde(rename_all = "kebab-case")]
    Partial {
        #[serde(default)]
        keep_prefix: usize,
        #[serde(default)]
        keep_suffix: usize,
    },
    /// `j***@example.com`
    Email,
    /// First three and last four characters kept: `138****5678`.
    Phone,
    /// First letter of each word kept: `J*** S****`.
    Name,
}

pub fn mask(value: &str, style: &MaskStyle) -> String {
    match style {
        MaskStyle::Full => full(value),
        MaskStyle::Partial {
            keep_prefix,
            keep_suffix,
        } => partial(value, *keep_prefix, *keep_suffix),
        MaskStyle::Email => match value.split_once('@') {
            Some((local, domain)) if !local.is_empty() => {
                let first: String = local.chars().take(1).collect();
                format!("{first}***@{domain}")
            }
            _ => full(value),
        },
        MaskStyle::Phone => partial_fixed(value, 3, 4),
        MaskStyle::Name => value
            .split(' ')
            .map(|word| partial(word, 1, 0))
            .collect::<Vec<_>>()
            .join(" "),
    }
}

fn full(value: &str) -> String {
    value.chars().map(|_| MASK_CHAR).collect()
}

fn partial(value: &str, keep_prefix: usize, keep_suffix: usize) -> String {
    let chars: Vec<char> = value.chars().collect();
    if keep_prefix + keep_suffix >= chars.len() {
        return full(value);
    }
    chars
        .iter()
        .enumerate()
        .map(|(idx, c)| {
            if idx < keep_prefix || idx >= chars.len() - keep_suffix {
                *c
            } else {
                MASK_CHAR
            }
        })
        .collect()
}

fn partial_fixed(value: &str, keep_prefix: usize, keep_suffix: usize) -> String {
    let chars: Vec<char> = value.chars().collect();
    if keep_prefix + keep_suffix >= chars.len() {
        return full(value);
    }
    let head: String = chars[..keep_prefix].iter().collect();
    let tail: String = chars[chars.len() - keep_suffix..].iter().collect();
    format!("{head}****{tail}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn masks_by_style() {
        assert_eq!(mask("secret", &MaskStyle::Full), "******");
        assert_eq!(
            mask(
                "4111111111111111",
                &MaskStyle::Partial {
                    keep_prefix: 0,
                    keep_suffix: 4
                }
            ),
            "************1111"
        );
        assert_eq!(mask("john@example.com", &MaskStyle::Email), "j***@example.com");
        assert_eq!(mask("13812345678", &MaskStyle::Phone), "138****5678");
        assert_eq!(mask("John Smith", &MaskStyle::Name), "J*** S****");
    }

    #[test]
    fn short_values_are_fully_masked() {
        assert_eq!(
            mask(
                "ab",
                &MaskStyle::Partial {
                    keep_prefix: 1,
                    keep_suffix: 1
                }
            ),
            "**"
        );
        assert_eq!(mask("12345", &MaskStyle::Phone), "*****");
        assert_eq!(mask("not-an-email", &MaskStyle::Email), "************");
    }

    #[test]
    fn style_parses_from_tagged_json() {
        let style: MaskStyle =
            serde_json::from_str(r#"{"style":"partial","keep-suffix":4}"#).unwrap();
        assert_eq!(
            style,
            MaskStyle::Partial {
                keep_prefix: 0,
                keep_suffix: 4
            }
        );
    }
}
