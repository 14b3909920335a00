//! Search-domain expansion.
//!
//! Unqualified names are combined with the network's search list. A
//! name with a trailing dot is absolute and never expanded; a name with
//! interior dots is tried as given before the search list; a bare label
//! is only ever tried with the search list appended, with the bare form
//! as a last resort.

use std::str::FromStr;

use domain::base::name::Name;

use crate::config::valid_hostname;
use crate::error::LookupError;

/// Produces the fully qualified candidates for an input name, in the
/// order they are to be tried.
pub(crate) fn candidates(
    input: &str,
    search_domains: &[String],
) -> Result<Vec<Name<Vec<u8>>>, LookupError> {
    let trimmed = input.trim();
    if trimmed.is_empty() || !valid_hostname(trimmed.trim_end_matches('.'))
    {
        return Err(LookupError::HostNotFound);
    }

    let absolute = trimmed.ends_with('.');
    let as_given = Name::from_str(trimmed.trim_end_matches('.'))
        .map_err(|_| LookupError::HostNotFound)?;
    if absolute {
        return Ok(vec![as_given]);
    }

    let expansions = search_domains.iter().filter_map(|domain| {
        Name::from_str(&format!("{}.{}", trimmed, domain)).ok()
    });

    let mut out = Vec::new();
    if trimmed.contains('.') {
        out.push(as_given);
        out.extend(expansions);
    } else {
        out.extend(expansions);
        out.push(as_given);
    }
    out.dedup();
    Ok(out)
}

//============ Tests =========================================================
