/// Maximum length of a generated slug.
const SLUG_MAX_LEN: usize = 48;

/// Turn a task title into a branch-safe slug: lowercase ASCII alphanumerics,
/// runs of anything else collapsed to a single `-`, trimmed of leading and
/// trailing dashes, clamped to 48 characters. Empty input slugs to "task".
pub fn slug(input: &str) -> String {
    let mut out = String::with_capacity(input.len());
    let mut pending_dash = false;

    for ch in input.chars() {
        let lower = ch.to_ascii_lowercase();
        if lower.is_ascii_alphanumeric() {
            if pending_dash && !out.is_empty() {
                out.push('-');
            }
            pending_dash = false;
            out.push(lower);
        } else {
            pending_dash = true;
        }
    }

    let mut out = if out.len() > SLUG_MAX_LEN {
        out.truncate(SLUG_MAX_LEN);
        out
    } else {
        out
    };

    while out.ends_with('-') {
        out.pop();
    }

    if out.is_empty() {
        "task".to_string()
    } else {
        out
    }
}

/// Disambiguate `candidate` against `taken` by appending `-2`, `-3`, ...
/// until the name is unused. Returns `candidate` unchanged when free.
pub fn unique_name<S: AsRef<str>>(candidate: &str, taken: &[S]) -> String {
    let is_taken = |name: &str| taken.iter().any(|t| t.as_ref() == name);

    if !is_taken(candidate) {
        return candidate.to_string();
    }

    let mut counter = 2;
    loop {
        let next = format!("{}-{}", candidate, counter);
        if !is_taken(&next) {
            return next;
        }
        counter += 1;
    }
}
