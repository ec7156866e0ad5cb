//! Text normalization shared by indexing and querying.
//!
//! The same [`TextNormalizer`] must process knowledge entries and user
//! questions, otherwise their embeddings drift apart. Normalization:
//! 1. Lowercases the text (optionally folding accents)
//! 2. Replaces every character that is not alphanumeric or `_` with a space,
//!    so technical names such as `ai_licia` survive intact
//! 3. Drops one-character tokens and stopwords
//! 4. Joins the remaining tokens with single spaces

use kbqa_core::config::NormalizerSettings;
use sha2::{Digest, Sha256};
use std::collections::BTreeSet;

/// Built-in French stopwords: articles, prepositions, conjunctions, pronouns,
/// auxiliary and modal verb forms, frequent adverbs and interrogatives.
pub const FRENCH_STOPWORDS: &[&str] = &[
    // articles
    "le", "la", "les", "un", "une", "des", "du", "de",
    // prepositions
    "au", "aux", "avec", "chez", "dans", "en", "entre", "par", "pour", "sans", "sous", "sur",
    "vers", "contre", "depuis", "durant", "pendant", "jusque", "jusqu", "dès", "avant", "après",
    "derrière", "devant", "près", "loin", "autour", "hors", "malgré", "selon", "sauf",
    // conjunctions
    "et", "ou", "mais", "donc", "or", "ni", "car", "que", "quand", "si", "lorsque", "puisque",
    "comme", "parce", "alors", "puis", "ensuite", "cependant", "pourtant", "toutefois",
    "néanmoins",
    // personal pronouns
    "je", "tu", "il", "elle", "on", "nous", "vous", "ils", "elles", "me", "te", "se", "lui",
    "leur", "eux", "moi", "toi", "soi",
    // demonstratives
    "ce", "ceci", "cela", "ça", "celui", "celle", "ceux", "celles", "ci", "là",
    // relatives and interrogatives
    "qui", "quoi", "dont", "où", "lequel", "laquelle", "lesquels", "lesquelles", "duquel",
    "auquel", "auxquels", "auxquelles", "comment", "pourquoi", "combien", "quel", "quelle",
    "quels", "quelles",
    // possessives
    "mon", "ma", "mes", "ton", "ta", "tes", "son", "sa", "ses", "notre", "nos", "votre", "vos",
    "leurs",
    // être
    "suis", "es", "est", "sommes", "êtes", "sont", "étais", "était", "étions", "étiez",
    "étaient", "serai", "seras", "sera", "serons", "serez", "seront", "serais", "serait",
    "serions", "seriez", "seraient", "sois", "soit", "soyons", "soyez", "soient", "fus", "fut",
    "fûmes", "fûtes", "furent", "été", "être",
    // avoir
    "ai", "as", "avons", "avez", "ont", "avais", "avait", "avions", "aviez", "avaient", "aurai",
    "auras", "aura", "aurons", "aurez", "auront", "aurais", "aurait", "aurions", "auriez",
    "auraient", "aie", "aies", "ait", "ayons", "ayez", "aient", "eus", "eut", "eûmes", "eûtes",
    "eurent", "eu", "avoir",
    // frequent verbs
    "fait", "faire", "fais", "font", "vais", "vas", "va", "allons", "allez", "vont", "aller",
    "peux", "peut", "pouvons", "pouvez", "peuvent", "pouvoir", "dois", "doit", "devons", "devez",
    "doivent", "devoir", "veux", "veut", "voulons", "voulez", "veulent", "vouloir", "sais",
    "sait", "savons", "savez", "savent", "faut",
    // adverbs
    "ne", "pas", "plus", "moins", "très", "trop", "assez", "bien", "aussi", "encore",
    "toujours", "jamais", "souvent", "parfois", "déjà", "ici", "oui", "non", "vraiment",
    "seulement", "beaucoup",
    // quantifiers
    "tout", "tous", "toute", "toutes", "aucun", "aucune", "chaque", "même", "mêmes", "autre",
    "autres", "tel", "telle", "tels", "telles", "plusieurs", "quelque", "quelques", "peu",
];

/// Deterministic text normalizer.
#[derive(Debug, Clone)]
pub struct TextNormalizer {
    stopwords: BTreeSet<String>,
    remove_stopwords: bool,
    fold_accents: bool,
}

impl Default for TextNormalizer {
    fn default() -> Self {
        Self::new(&NormalizerSettings::default())
    }
}

impl TextNormalizer {
    /// Build a normalizer from settings.
    ///
    /// The effective stopword list is the built-in French list plus
    /// `extra_stopwords`, minus `keep_words`. Configured words go through the
    /// same case and accent handling as the text they are matched against.
    pub fn new(settings: &NormalizerSettings) -> Self {
        let mut normalizer = Self {
            stopwords: BTreeSet::new(),
            remove_stopwords: settings.remove_stopwords,
            fold_accents: settings.fold_accents,
        };

        let canonical = |word: &str| normalizer.canonical_word(word);

        let mut stopwords: BTreeSet<String> = FRENCH_STOPWORDS
            .iter()
            .copied()
            .chain(settings.extra_stopwords.iter().map(String::as_str))
            .map(canonical)
            .collect();

        for word in &settings.keep_words {
            stopwords.remove(&canonical(word));
        }

        normalizer.stopwords = stopwords;
        normalizer
    }

    /// The effective stopword list, sorted.
    pub fn stopwords(&self) -> impl Iterator<Item = &str> {
        self.stopwords.iter().map(String::as_str)
    }

    /// Normalize `text`. Empty input yields empty output.
    pub fn normalize(&self, text: &str) -> String {
        let lowered = self.canonical_word(text);

        let cleaned: String = lowered
            .chars()
            .map(|c| if c.is_alphanumeric() || c == '_' { c } else { ' ' })
            .collect();

        cleaned
            .split_whitespace()
            .filter(|token| token.chars().count() > 1)
            .filter(|token| !(self.remove_stopwords && self.stopwords.contains(*token)))
            .collect::<Vec<_>>()
            .join(" ")
    }

    /// Text handed to the embedder, for entries and queries alike: the
    /// normalized form, or the trimmed lowercase text when normalization
    /// leaves nothing (a question made only of stopwords).
    pub fn embedding_text(&self, text: &str) -> String {
        let normalized = self.normalize(text);
        if normalized.is_empty() {
            self.canonical_word(text.trim())
        } else {
            normalized
        }
    }

    /// Digest of every setting that changes `normalize` output. Two
    /// normalizers with the same signature produce the same text.
    pub fn signature(&self) -> String {
        let mut hasher = Sha256::new();
        hasher.update([self.remove_stopwords as u8, self.fold_accents as u8]);
        for word in &self.stopwords {
            hasher.update(word.as_bytes());
            hasher.update([0u8]);
        }
        format!("{:x}", hasher.finalize())
    }

    fn canonical_word(&self, word: &str) -> String {
        let lowered = word.to_lowercase();
        if self.fold_accents {
            fold_accents(&lowered)
        } else {
            lowered
        }
    }
}

/// Replace accented Latin letters with their unaccented form.
pub fn fold_accents(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    for c in text.chars() {
        match c {
            'à' | 'â' | 'ä' | 'á' | 'ã' | 'å' => out.push('a'),
            'é' | 'è' | 'ê' | 'ë' => out.push('e'),
            'î' | 'ï' | 'í' | 'ì' => out.push('i'),
            'ô' | 'ö' | 'ó' | 'ò' | 'õ' => out.push('o'),
            'ù' | 'û' | 'ü' | 'ú' => out.push('u'),
            'ÿ' | 'ý' => out.push('y'),
            'ç' => out.push('c'),
            'ñ' => out.push('n'),
            'œ' => out.push_str("oe"),
            'æ' => out.push_str("ae"),
            'À' | 'Â' | 'Ä' | 'Á' | 'Ã' | 'Å' => out.push('A'),
            'É' | 'È' | 'Ê' | 'Ë' => out.push('E'),
            'Î' | 'Ï' | 'Í' | 'Ì' => out.push('I'),
            'Ô' | 'Ö' | 'Ó' | 'Ò' | 'Õ' => out.push('O'),
            'Ù' | 'Û' | 'Ü' | 'Ú' => out.push('U'),
            'Ç' => out.push('C'),
            'Ñ' => out.push('N'),
            'Œ' => out.push_str("OE"),
            'Æ' => out.push_str("AE"),
            other => out.push(other),
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn normalizer() -> TextNormalizer {
        TextNormalizer::default()
    }

    #[test]
    fn test_keeps_technical_tokens() {
        assert_eq!(
            normalizer().normalize("Comment configurer le TTS sur AI_licia ?"),
            "configurer tts ai_licia"
        );
    }

    #[test]
    fn test_punctuation_and_elisions() {
        assert_eq!(
            normalizer().normalize("L'installation d'OBS, c'est facile!"),
            "installation obs facile"
        );
    }

    #[test]
    fn test_empty_input() {
        assert_eq!(normalizer().normalize(""), "");
        assert_eq!(normalizer().normalize("  ?! "), "");
    }

    #[test]
    fn test_idempotent() {
        let n = normalizer();
        let samples = [
            "Comment installer AI_licia ?",
            "Quelle est la capitale de la France ?",
            "ÉTÉ À Paris : 42 °C — œuvre İstanbul ß",
            "a b c d_e __ x1 99",
            "Ça marche très bien, merci !!!",
        ];
        for sample in samples {
            let once = n.normalize(sample);
            assert_eq!(n.normalize(&once), once, "not idempotent for {:?}", sample);
        }
    }

    #[test]
    fn test_stopwords_can_be_disabled() {
        let settings = NormalizerSettings {
            remove_stopwords: false,
            ..NormalizerSettings::default()
        };
        let n = TextNormalizer::new(&settings);
        assert_eq!(n.normalize("Comment installer ?"), "comment installer");
    }

    #[test]
    fn test_signature_tracks_settings() {
        let base = normalizer().signature();
        assert_eq!(base, TextNormalizer::default().signature());

        let folded = TextNormalizer::new(&NormalizerSettings {
            fold_accents: true,
            ..NormalizerSettings::default()
        });
        assert_ne!(folded.signature(), base);

        let extra = TextNormalizer::new(&NormalizerSettings {
            extra_stopwords: vec!["merci".to_string()],
            ..NormalizerSettings::default()
        });
        assert_ne!(extra.signature(), base);
    }

    #[test]
    fn test_extra_and_kept_words() {
        let settings = NormalizerSettings {
            extra_stopwords: vec!["Merci".to_string()],
            keep_words: vec!["Comment".to_string()],
            ..NormalizerSettings::default()
        };
        let n = TextNormalizer::new(&settings);
        assert_eq!(n.normalize("Merci, comment installer ?"), "comment installer");
        assert!(n.stopwords().any(|w| w == "merci"));
        assert!(!n.stopwords().any(|w| w == "comment"));
    }

    #[test]
    fn test_fold_accents() {
        let settings = NormalizerSettings {
            fold_accents: true,
            ..NormalizerSettings::default()
        };
        let n = TextNormalizer::new(&settings);
        assert_eq!(n.normalize("Paramètres de sécurité"), "parametres securite");
        // "très" folds to "tres" and still matches the folded stopword list
        assert_eq!(n.normalize("très rapide"), "rapide");
    }

    mod proptest_normalize {
        use super::*;
        use proptest::prelude::*;

        const TEXT: &str = "[a-zA-Z0-9_àâçéèêëîïôûùüÿœÀÉÈÇ ,.;:!?'()-]{0,80}";

        fn settings() -> impl Strategy<Value = NormalizerSettings> {
            (any::<bool>(), any::<bool>()).prop_map(|(remove_stopwords, fold_accents)| {
                NormalizerSettings {
                    remove_stopwords,
                    fold_accents,
                    ..NormalizerSettings::default()
                }
            })
        }

        proptest! {
            #[test]
            fn idempotent(text in TEXT, settings in settings()) {
                let n = TextNormalizer::new(&settings);
                let once = n.normalize(&text);
                prop_assert_eq!(n.normalize(&once), once);
            }

            /// Output holds no stopword and no one-character token.
            #[test]
            fn tokens_are_kept_words(text in TEXT) {
                let n = normalizer();
                let normalized = n.normalize(&text);
                for token in normalized.split(' ').filter(|t| !t.is_empty()) {
                    prop_assert!(token.chars().count() > 1, "{token:?} in {normalized:?}");
                    prop_assert!(!n.stopwords().any(|w| w == token), "{token:?} in {normalized:?}");
                }
            }

            /// Stopword sentences still yield text to embed.
            #[test]
            fn embedding_text_is_empty_only_for_blank_input(text in TEXT) {
                let n = normalizer();
                prop_assert_eq!(n.embedding_text(&text).is_empty(), text.trim().is_empty());
            }
        }
    }
}
