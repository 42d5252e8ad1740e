//! Search URL construction for the Numista catalogue.
//!
//! The endpoint, parameter set and parameter order are a compatibility
//! contract with the site: every fixed parameter must be present (empty)
//! and only `r=` (free text) and `no=` (catalogue number filter) vary.

use url::form_urlencoded;

const SEARCH_ENDPOINT: &str = "https://en.numista.com/catalogue/index.php";

/// Ordered longest-form-first so a substitution never re-matches its own
/// output (e.g. "kopeks" -> "kopecks" before "kopek" -> "kopeck").
const DENOMINATION_SPELLINGS: &[(&str, &str)] = &[
    ("kopeks", "kopecks"),
    ("kopek", "kopeck"),
    ("rubles", "roubles"),
    ("ruble", "rouble"),
];

/// Digits-only view of a free-form catalogue reference such as "KM# 38".
/// Returns None when no digits remain.
pub fn catalog_number_digits(raw: &str) -> Option<String> {
    let digits: String = raw.chars().filter(|ch| ch.is_ascii_digit()).collect();
    if digits.is_empty() { None } else { Some(digits) }
}

/// Build the search URL for one coin.
///
/// With a usable catalogue number the free text is restricted to
/// `issuer year` and the number goes into the dedicated `no=` filter;
/// denomination spelling variance would only hurt recall there. Without
/// one, the normalized denomination joins the free text.
pub fn build_search_url(
    issuer: &str,
    denomination: &str,
    year: &str,
    catalog_reference: &str,
) -> String {
    let number = catalog_number_digits(catalog_reference).unwrap_or_default();

    let query_text = if number.is_empty() {
        let denomination = strip_parenthetical(&normalize_denomination(denomination));
        format!("{issuer} {denomination} {year}")
    } else {
        format!("{issuer} {year}")
    };

    format!(
        "{SEARCH_ENDPOINT}?r={}&st=147&cat=y&im1=&im2=&ru=&ie=&ca=3&no={}\
         &v=&cu=&a=&dg=&i=&b=&m=&f=&t=&t2=&w=&mt=&u=&g=&c=&wi=&sw=",
        quote_plus(&query_text),
        quote_plus(&number),
    )
}

fn normalize_denomination(denomination: &str) -> String {
    let mut normalized = denomination.to_string();
    for (from, to) in DENOMINATION_SPELLINGS {
        normalized = normalized.replace(from, to);
    }
    normalized
}

fn strip_parenthetical(denomination: &str) -> String {
    let mut out = String::with_capacity(denomination.len());
    let mut depth = 0_u32;
    for ch in denomination.chars() {
        match ch {
            '(' => depth += 1,
            ')' => depth = depth.saturating_sub(1),
            _ if depth == 0 => out.push(ch),
            _ => {}
        }
    }
    out.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// Percent-encode with application/x-www-form-urlencoded rules (space -> +).
fn quote_plus(text: &str) -> String {
    form_urlencoded::byte_serialize(text.as_bytes()).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn catalog_reference_reduces_to_digits() {
        assert_eq!(catalog_number_digits("KM# 38"), Some("38".to_string()));
        assert_eq!(catalog_number_digits("38"), Some("38".to_string()));
        assert_eq!(catalog_number_digits("KM# "), None);
        assert_eq!(catalog_number_digits(""), None);
    }

    #[test]
    fn with_catalog_number_query_is_issuer_and_year_only() {
        let url = build_search_url("Papal States", "10 soldi (scudo)", "1867", "KM# 38");
        assert_eq!(
            url,
            "https://en.numista.com/catalogue/index.php?r=Papal+States+1867\
             &st=147&cat=y&im1=&im2=&ru=&ie=&ca=3&no=38\
             &v=&cu=&a=&dg=&i=&b=&m=&f=&t=&t2=&w=&mt=&u=&g=&c=&wi=&sw="
        );
    }

    #[test]
    fn without_catalog_number_denomination_is_normalized_and_included() {
        let url = build_search_url("Russia", "1 kopek", "1900", "");
        assert!(url.contains("r=Russia+1+kopeck+1900"));
        assert!(url.contains("&no=&"));
    }

    #[test]
    fn plural_spellings_substitute_before_singular() {
        assert_eq!(normalize_denomination("5 kopeks"), "5 kopecks");
        assert_eq!(normalize_denomination("2 rubles"), "2 roubles");
        assert_eq!(normalize_denomination("1 ruble"), "1 rouble");
    }

    #[test]
    fn parenthetical_suffix_is_stripped() {
        assert_eq!(strip_parenthetical("2 shillings (florin)"), "2 shillings");
        assert_eq!(strip_parenthetical("10 soldi"), "10 soldi");
    }
}
