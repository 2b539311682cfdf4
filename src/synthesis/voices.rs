//! Voice inventory parsing and language-aware voice selection.

use serde::{Deserialize, Serialize};

/// A voice offered by the speech engine.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Voice {
    /// Value passed to the engine to select this voice.
    pub id: String,
    /// Human-readable name.
    pub name: String,
    /// Locale as reported by the engine (`en_US`, `en-us`, `en`).
    pub locale: String,
}

impl Voice {
    pub fn new(id: impl Into<String>, name: impl Into<String>, locale: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            locale: locale.into(),
        }
    }

    fn family(&self) -> String {
        language_family(&normalize_locale(&self.locale))
    }
}

/// Lowercase a locale and use `-` as the separator: `en_US` → `en-us`.
pub fn normalize_locale(locale: &str) -> String {
    locale.trim().replace('_', "-").to_lowercase()
}

fn language_family(normalized: &str) -> String {
    normalized
        .split('-')
        .next()
        .unwrap_or_default()
        .to_owned()
}

/// Pick the voice for `language`.
///
/// Order: a preferred name (substring match) in the same language family,
/// then an exact locale match, then any voice of the language family, then
/// whatever the engine lists first.
pub fn select_voice<'a>(
    voices: &'a [Voice],
    language: &str,
    preferred: &[String],
) -> Option<&'a Voice> {
    let wanted = normalize_locale(language);
    let family = language_family(&wanted);

    preferred
        .iter()
        .filter(|p| !p.trim().is_empty())
        .find_map(|p| {
            voices
                .iter()
                .find(|v| v.name.contains(p.as_str()) && v.family() == family)
        })
        .or_else(|| voices.iter().find(|v| normalize_locale(&v.locale) == wanted))
        .or_else(|| voices.iter().find(|v| v.family() == family))
        .or_else(|| voices.first())
}

/// Parse an engine's voice listing.
///
/// Understands the `say -v ?` format (`Name   en_US   # sample`) and the
/// `espeak-ng --voices` table (header row starting with `Pty`). Unparseable
/// lines are skipped.
pub fn parse_voice_listing(listing: &str) -> Vec<Voice> {
    let is_espeak = listing
        .lines()
        .next()
        .is_some_and(|first| first.trim_start().starts_with("Pty"));
    if is_espeak {
        listing.lines().skip(1).filter_map(parse_espeak_row).collect()
    } else {
        listing.lines().filter_map(parse_say_row).collect()
    }
}

fn parse_say_row(line: &str) -> Option<Voice> {
    let left = line.split('#').next()?.trim();
    let mut tokens: Vec<&str> = left.split_whitespace().collect();
    let locale = tokens.pop()?;
    if tokens.is_empty() || !looks_like_locale(locale) {
        return None;
    }
    let name = tokens.join(" ");
    Some(Voice::new(name.clone(), name, locale))
}

fn parse_espeak_row(line: &str) -> Option<Voice> {
    let tokens: Vec<&str> = line.split_whitespace().collect();
    // Pty Language Age/Gender VoiceName File [Other Languages]
    if tokens.len() < 5 || tokens[0].parse::<u32>().is_err() {
        return None;
    }
    let locale = tokens[1];
    if !looks_like_locale(locale) {
        return None;
    }
    Some(Voice::new(locale, tokens[3], locale))
}

fn looks_like_locale(token: &str) -> bool {
    let normalized = normalize_locale(token);
    let mut parts = normalized.split('-');
    let lang = parts.next().unwrap_or_default();
    (2..=3).contains(&lang.len())
        && lang.chars().all(|c| c.is_ascii_alphabetic())
        && parts.all(|p| !p.is_empty() && p.chars().all(|c| c.is_ascii_alphanumeric()))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn inventory() -> Vec<Voice> {
        vec![
            Voice::new("Amelie", "Amelie", "fr_CA"),
            Voice::new("Daniel", "Daniel", "en_GB"),
            Voice::new("Samantha", "Samantha", "en_US"),
            Voice::new("Microsoft David Desktop", "Microsoft David Desktop", "en-US"),
        ]
    }

    fn prefs(names: &[&str]) -> Vec<String> {
        names.iter().map(|s| (*s).to_owned()).collect()
    }

    #[test]
    fn preferred_name_wins() {
        let voices = inventory();
        let chosen = select_voice(&voices, "en-US", &prefs(&["Google US English", "Microsoft David"]));
        assert_eq!(chosen.map(|v| v.name.as_str()), Some("Microsoft David Desktop"));
    }

    #[test]
    fn preferred_name_in_wrong_language_is_skipped() {
        let voices = inventory();
        let chosen = select_voice(&voices, "en-US", &prefs(&["Amelie"]));
        assert_eq!(chosen.map(|v| v.name.as_str()), Some("Samantha"));
    }

    #[test]
    fn exact_locale_beats_family() {
        let voices = inventory();
        let chosen = select_voice(&voices, "en_us", &[]);
        assert_eq!(chosen.map(|v| v.name.as_str()), Some("Samantha"));
    }

    #[test]
    fn family_prefix_is_second_fallback() {
        let voices = inventory();
        let chosen = select_voice(&voices, "en-AU", &[]);
        assert_eq!(chosen.map(|v| v.name.as_str()), Some("Daniel"));
    }

    #[test]
    fn any_voice_is_last_resort() {
        let voices = inventory();
        let chosen = select_voice(&voices, "ja-JP", &[]);
        assert_eq!(chosen.map(|v| v.name.as_str()), Some("Amelie"));
        assert!(select_voice(&[], "en-US", &[]).is_none());
    }

    #[test]
    fn parses_say_listing() {
        let listing = "\
Alex                en_US    # Most people recognize me by my voice.
Bad News            en_US    # The light you see at the end of the tunnel is the headlamp.
Amelie              fr_CA    # Bonjour, je m'appelle Amelie.
garbage line without locale
";
        let voices = parse_voice_listing(listing);
        assert_eq!(voices.len(), 3);
        assert_eq!(voices[1], Voice::new("Bad News", "Bad News", "en_US"));
        assert_eq!(voices[2].locale, "fr_CA");
    }

    #[test]
    fn parses_espeak_listing() {
        let listing = "\
Pty Language       Age/Gender VoiceName          File                 Other Languages
 5  af              --/M      Afrikaans          gmw/af
 2  en-us           --/M      English_(America)  gmw/en-US            (en 3)
";
        let voices = parse_voice_listing(listing);
        assert_eq!(voices.len(), 2);
        assert_eq!(voices[1], Voice::new("en-us", "English_(America)", "en-us"));

        let chosen = select_voice(&voices, "en-US", &[]);
        assert_eq!(chosen.map(|v| v.id.as_str()), Some("en-us"));
    }
}
