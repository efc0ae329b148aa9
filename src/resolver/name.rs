//! Query name handling: normalisation, registered domain and the ordered
//! candidate suffixes that are matched against the category tables.

/// Normalise a presentation-format name for matching.
///
/// Strips surrounding whitespace and exactly one trailing root dot, then
/// folds ASCII letters to lower case. Matching is case-insensitive.
pub fn normalize(name: &str) -> String {
    let name = name.trim();
    let name = name.strip_suffix('.').unwrap_or(name);
    name.to_ascii_lowercase()
}

/// Registered (organisational) domain of a normalised name, e.g.
/// `example.co.uk` for `a.b.example.co.uk`.
///
/// `None` when the name is itself a public suffix.
pub fn registered_domain(name: &str) -> Option<&str> {
    psl::domain_str(name)
}

/// Candidate suffixes, most specific first.
///
/// Every label suffix with at least two labels is a candidate, except the
/// public suffix itself: `a.b.example.com` yields `a.b.example.com`,
/// `b.example.com`, `example.com`.
pub fn candidates(name: &str) -> Vec<&str> {
    if name.is_empty() {
        return Vec::new();
    }
    let public_len = psl::suffix_str(name).map(str::len).unwrap_or(0);

    let mut out = Vec::new();
    let mut current = name;
    loop {
        let Some(pos) = current.find('.') else {
            break;
        };
        if current.len() <= public_len {
            break;
        }
        out.push(current);
        current = &current[pos + 1..];
    }
    out
}
