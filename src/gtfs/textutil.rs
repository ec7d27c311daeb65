use crate::gtfs::tables::NameReplacement;

//tokens kept lowercase when title-casing route names
const LINKING_WORDS: [&str; 4] = ["da", "de", "do", "via"];

pub fn to_hex_color(color: rgb::RGBA8) -> String {
    format!(
        "#{:02x}{:02x}{:02x}{:02x}",
        color.r, color.g, color.b, color.a
    )
}

fn lowercase_char(c: char) -> char {
    c.to_lowercase().next().unwrap_or(c)
}

//case-insensitive substring replacement, every occurrence
fn replace_ci(text: &str, from: &str, to: &str) -> String {
    let chars: Vec<char> = text.chars().collect();
    let needle: Vec<char> = from.chars().map(lowercase_char).collect();
    if needle.is_empty() {
        return text.to_string();
    }

    let mut out = String::with_capacity(text.len());
    let mut i = 0;
    while i < chars.len() {
        if matches_at(&chars, i, &needle) {
            out.push_str(to);
            i += needle.len();
        } else {
            out.push(chars[i]);
            i += 1;
        }
    }
    out
}

//like replace_ci but only at word boundaries (string edge or non-alphanumeric neighbour)
fn replace_word_ci(text: &str, from: &str, to: &str) -> String {
    let chars: Vec<char> = text.chars().collect();
    let needle: Vec<char> = from.chars().map(lowercase_char).collect();
    if needle.is_empty() {
        return text.to_string();
    }

    let mut out = String::with_capacity(text.len());
    let mut i = 0;
    while i < chars.len() {
        let end = i + needle.len();
        let bounded = (i == 0 || !chars[i - 1].is_alphanumeric())
            && (end >= chars.len() || !chars[end].is_alphanumeric());
        if bounded && matches_at(&chars, i, &needle) {
            out.push_str(to);
            i = end;
        } else {
            out.push(chars[i]);
            i += 1;
        }
    }
    out
}

fn matches_at(chars: &[char], at: usize, needle: &[char]) -> bool {
    chars.len() - at >= needle.len()
        && chars[at..at + needle.len()]
            .iter()
            .zip(needle)
            .all(|(c, n)| lowercase_char(*c) == *n)
}

fn title_case_word(word: &str) -> String {
    let mut chars = word.chars();
    match chars.next() {
        Some(first) => first.to_uppercase().collect::<String>() + chars.as_str(),
        None => String::new(),
    }
}

/// Route names arrive as shouty abbreviated strings like "CIRCULACAO P/ EVORA".
/// Expand "p/"/"POR" into "via", collapse whitespace, title-case everything but
/// the linking words, then restore diacritics and place names from the table.
pub fn normalize_route_name(replacements: &[NameReplacement], route_name: &str) -> String {
    if route_name.is_empty() {
        return String::new();
    }

    let replaced = replace_ci(route_name, "p/", "via ");
    let collapsed = replaced.split_whitespace().collect::<Vec<&str>>().join(" ");
    let with_via = collapsed.replace(" POR ", " via ").replace("POR ", "via ");

    let cased = with_via
        .to_lowercase()
        .split(' ')
        .map(|word| {
            if LINKING_WORDS.contains(&word) {
                word.to_string()
            } else {
                title_case_word(word)
            }
        })
        .collect::<Vec<String>>()
        .join(" ");

    let mut name = cased;
    for replacement in replacements {
        name = replace_word_ci(&name, &replacement.from, &replacement.to);
    }
    name
}
