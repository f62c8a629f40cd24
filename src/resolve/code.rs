use std::fmt;
use std::sync::LazyLock;

use regex::Regex;
use tracing::debug;

use crate::model::Marketplace;

/// Prefix carried by every numeric-family code.
pub const NUMERIC_PREFIX: &str = "MLB";
/// Leading letter every accepted ASIN carries.
pub const ASIN_LEAD: char = 'B';
/// URL text that routes extraction to the ASIN family.
const ASIN_MARKER: &str = "amazon";

// Priority order matters: the first pattern that matches decides.
static NUMERIC_PATTERNS: LazyLock<Vec<Regex>> = LazyLock::new(|| {
    [
        r"(?i)/(?:MLB-?)?(\d{10,})",
        r"(?i)/p/(?:MLB-?)?(\d{10,})",
        r"(?i)[?&]item_id=(?:MLB-?)?(\d{10,})",
    ]
    .iter()
    .map(|p| Regex::new(p).unwrap())
    .collect()
});

static ASIN_PATTERNS: LazyLock<Vec<Regex>> = LazyLock::new(|| {
    [
        r"(?i)/dp/([a-z0-9]{10})",
        r"(?i)/product/([a-z0-9]{10})",
        r"(?i)/gp/product/([a-z0-9]{10})",
        r"(?i)[?&]asin=([a-z0-9]{10})",
        r"(?i)/([a-z0-9]{10})(?:[/?#]|$)",
    ]
    .iter()
    .map(|p| Regex::new(p).unwrap())
    .collect()
});

static BARE_NUMERIC_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)^(?:MLB)?-?(\d{10,})$").unwrap());
static BARE_ASIN_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"(?i)^[a-z0-9]{10}$").unwrap());

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CodeFamily {
    /// `MLB-<10+ digits>`
    NumericId,
    /// 10 alphanumerics starting with `B`, upper-cased.
    AlnumAsin,
}

impl CodeFamily {
    /// Pick the family from the URL text alone.
    pub fn for_url(url: &str) -> Self {
        if url.to_lowercase().contains(ASIN_MARKER) {
            Self::AlnumAsin
        } else {
            Self::NumericId
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::NumericId => "numeric-id",
            Self::AlnumAsin => "alnum-asin",
        }
    }

    fn patterns(self) -> &'static [Regex] {
        match self {
            Self::NumericId => &NUMERIC_PATTERNS,
            Self::AlnumAsin => &ASIN_PATTERNS,
        }
    }

    /// Turn a captured token into the canonical form, or reject it.
    fn canonical(self, token: &str) -> Option<String> {
        match self {
            Self::NumericId => Some(format!("{NUMERIC_PREFIX}-{token}")),
            Self::AlnumAsin => {
                let upper = token.to_ascii_uppercase();
                upper.starts_with(ASIN_LEAD).then_some(upper)
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ListingCode {
    family: CodeFamily,
    value: String,
}

impl ListingCode {
    pub fn family(&self) -> CodeFamily {
        self.family
    }

    pub fn as_str(&self) -> &str {
        &self.value
    }

    /// Normalize a code that arrives on its own (callback payloads, manual
    /// entry): `mlb1234567890` and `MLB-1234567890` both become
    /// `MLB-1234567890`, `b07xyz1234` becomes `B07XYZ1234`.
    pub fn normalize(raw: &str) -> Option<Self> {
        let raw = raw.trim();
        if let Some(caps) = BARE_NUMERIC_RE.captures(raw) {
            let family = CodeFamily::NumericId;
            return Some(Self {
                family,
                value: family.canonical(&caps[1])?,
            });
        }
        if BARE_ASIN_RE.is_match(raw) {
            let family = CodeFamily::AlnumAsin;
            return Some(Self {
                family,
                value: family.canonical(raw)?,
            });
        }
        None
    }
}

impl fmt::Display for ListingCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.value)
    }
}

/// Pull the canonical listing code out of a URL.
///
/// The family comes from the URL text, not from `hint`; the hint only
/// annotates the trace. Within a family the first matching pattern decides,
/// so an ASIN-family token that does not start with `B` yields `None` even
/// if a later pattern would have captured something else.
pub fn extract_code(url: &str, hint: Option<&Marketplace>) -> Option<ListingCode> {
    let family = CodeFamily::for_url(url);
    let token = family
        .patterns()
        .iter()
        .find_map(|re| re.captures(url).map(|c| c[1].to_string()))?;

    let code = family.canonical(&token).map(|value| ListingCode { family, value });
    debug!(
        url,
        family = family.as_str(),
        marketplace = hint.map(|m| m.name.as_str()),
        code = code.as_ref().map(ListingCode::as_str),
        "code extraction"
    );
    code
}

#[cfg(test)]
mod tests {
    use super::*;

    fn code(url: &str) -> Option<String> {
        extract_code(url, None).map(|c| c.to_string())
    }

    #[test]
    fn numeric_path_segment() {
        assert_eq!(code("https://x.com/MLB-1234567890-foo").as_deref(), Some("MLB-1234567890"));
        assert_eq!(
            code("https://produto.mercadolivre.com.br/MLB-3456789012-tenis-_JM").as_deref(),
            Some("MLB-3456789012")
        );
        assert_eq!(code("https://x.com/12345678901").as_deref(), Some("MLB-12345678901"));
        assert_eq!(code("https://x.com/item/123456789"), None);
    }

    #[test]
    fn numeric_under_p_segment() {
        assert_eq!(code("https://x.com/p/MLB9876543210").as_deref(), Some("MLB-9876543210"));
        assert_eq!(code("https://x.com/tenis/p/12345678901").as_deref(), Some("MLB-12345678901"));
    }

    #[test]
    fn numeric_item_id_query() {
        assert_eq!(
            code("https://www.mercadolivre.com.br/tenis/p/X?item_id=MLB1122334455&x=1").as_deref(),
            Some("MLB-1122334455")
        );
        assert_eq!(
            code("https://www.mercadolivre.com.br/x?foo=1&item_id=5566778899").as_deref(),
            Some("MLB-5566778899")
        );
    }

    #[test]
    fn numeric_needs_ten_digits() {
        assert_eq!(code("https://x.com/MLB-123456789-foo"), None);
        assert_eq!(code("https://x.com/no-code-here"), None);
    }

    #[test]
    fn numeric_prefix_is_case_insensitive() {
        assert_eq!(code("https://x.com/mlb-1234567890").as_deref(), Some("MLB-1234567890"));
    }

    #[test]
    fn asin_shapes() {
        let cases = [
            ("https://amazon.com/dp/B07XYZ1234", "B07XYZ1234"),
            ("https://www.amazon.com.br/Some-Thing/dp/b07xyz1234/ref=sr_1", "B07XYZ1234"),
            ("https://www.amazon.com.br/product/B0ABCDEF12?th=1", "B0ABCDEF12"),
            ("https://www.amazon.com.br/gp/product/B0ABCDEF34", "B0ABCDEF34"),
            ("https://www.amazon.com.br/s?k=x&ASIN=B0ABCDEF56", "B0ABCDEF56"),
            ("https://www.amazon.com.br/B0ABCDEF78", "B0ABCDEF78"),
        ];
        for (url, expected) in cases {
            assert_eq!(code(url).as_deref(), Some(expected), "{url}");
        }
    }

    #[test]
    fn asin_must_start_with_lead_letter() {
        assert_eq!(code("https://amazon.com/dp/X07XYZ1234"), None);
        assert_eq!(code("https://amazon.com/dp/0123456789"), None);
    }

    #[test]
    fn first_asin_pattern_decides() {
        // `/dp/` captures a token without the lead letter; the bare segment
        // after it is never consulted.
        assert_eq!(code("https://amazon.com/dp/A07XYZ1234/B07XYZ1234"), None);
    }

    #[test]
    fn asin_family_ignores_numeric_shapes() {
        assert_eq!(code("https://www.amazon.com.br/MLB-1234567890"), None);
    }

    #[test]
    fn extraction_is_idempotent() {
        let url = "https://www.mercadolivre.com.br/p/MLB9876543210?item_id=MLB1111111111";
        assert_eq!(extract_code(url, None), extract_code(url, None));
        assert_eq!(code(url).as_deref(), Some("MLB-9876543210"));
    }

    #[test]
    fn hint_does_not_change_family() {
        let amazon = Marketplace {
            id: 2,
            name: "Amazon".into(),
            base_url: "https://www.amazon.com.br".into(),
            active: true,
        };
        let c = extract_code("https://x.com/MLB-1234567890", Some(&amazon)).unwrap();
        assert_eq!(c.family(), CodeFamily::NumericId);
    }

    #[test]
    fn normalize_standalone_codes() {
        let n = |raw: &str| ListingCode::normalize(raw).map(|c| c.to_string());
        assert_eq!(n("mlb1234567890").as_deref(), Some("MLB-1234567890"));
        assert_eq!(n(" MLB-1234567890 ").as_deref(), Some("MLB-1234567890"));
        assert_eq!(n("1234567890").as_deref(), Some("MLB-1234567890"));
        assert_eq!(n("b07xyz1234").as_deref(), Some("B07XYZ1234"));
        assert_eq!(n("C07XYZ1234"), None);
        assert_eq!(n("short"), None);
    }
}
