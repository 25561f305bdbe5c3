//! Text normalisation helpers for Italian place names.

use unicode_normalization::UnicodeNormalization;
use unicode_normalization::char::is_combining_mark;

/// Lowercases, trims, strips diacritics and collapses inner whitespace.
///
/// `"  Agliè "` and `"AGLIE"` both normalise to `"aglie"`.
pub fn normalise(text: &str) -> String {
    let folded: String = text
        .trim()
        .to_lowercase()
        .nfkd()
        .filter(|c| !is_combining_mark(*c))
        .collect();
    folded.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// Splits a normalised name into alphanumeric tokens, so that
/// `"reggio nell'emilia"` yields `["reggio", "nell", "emilia"]`.
pub fn tokens(normalised: &str) -> Vec<&str> {
    normalised
        .split(|c: char| !c.is_alphanumeric())
        .filter(|token| !token.is_empty())
        .collect()
}

/// Repairs the registry convention of spelling a final accented vowel as
/// vowel plus apostrophe: `Aglie'` becomes `Agliè`, `Sant'Angelo` is kept.
pub fn repair_accents(name: &str) -> String {
    let chars: Vec<char> = name.chars().collect();
    let mut out = String::with_capacity(name.len());
    let mut idx = 0;
    while idx < chars.len() {
        let current = chars[idx];
        let apostrophe_follows = chars.get(idx + 1) == Some(&'\'');
        let ends_word = match chars.get(idx + 2) {
            None => true,
            Some(next) => !next.is_ascii_alphabetic(),
        };
        if apostrophe_follows && ends_word {
            if let Some(accented) = grave(current) {
                out.push(accented);
                idx += 2;
                continue;
            }
        }
        out.push(current);
        idx += 1;
    }
    out
}

fn grave(vowel: char) -> Option<char> {
    Some(match vowel {
        'a' => 'à',
        'e' => 'è',
        'i' => 'ì',
        'o' => 'ò',
        'u' => 'ù',
        'A' => 'À',
        'E' => 'È',
        'I' => 'Ì',
        'O' => 'Ò',
        'U' => 'Ù',
        _ => return None,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalise_strips_case_and_diacritics() {
        assert_eq!(normalise("  Agliè "), "aglie");
        assert_eq!(normalise("FORLÌ"), "forli");
        assert_eq!(normalise("San  Donà   di Piave"), "san dona di piave");
    }

    #[test]
    fn repair_accents_only_touches_word_final_apostrophes() {
        assert_eq!(repair_accents("Aglie'"), "Agliè");
        assert_eq!(repair_accents("Cefalu' Marina"), "Cefalù Marina");
        assert_eq!(repair_accents("Sant'Angelo Lodigiano"), "Sant'Angelo Lodigiano");
        assert_eq!(repair_accents("Valle d'Aosta/Vallee d'Aoste"), "Valle d'Aosta/Vallee d'Aoste");
        assert_eq!(repair_accents("Forli'-Cesena"), "Forlì-Cesena");
    }

    #[test]
    fn tokens_split_on_punctuation() {
        assert_eq!(tokens("reggio nell'emilia"), vec!["reggio", "nell", "emilia"]);
        assert!(tokens("").is_empty());
    }
}
