/// Lowercase substrings whose presence in an analysis triggers an alert.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TriggerTerms {
    terms: Vec<String>,
}

impl TriggerTerms {
    pub fn new<I, S>(terms: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut terms: Vec<String> = terms
            .into_iter()
            .map(|t| t.as_ref().trim().to_lowercase())
            .filter(|t| !t.is_empty())
            .collect();
        terms.sort();
        terms.dedup();
        Self { terms }
    }

    pub fn is_empty(&self) -> bool {
        self.terms.is_empty()
    }

    pub fn len(&self) -> usize {
        self.terms.len()
    }

    /// First term found in `text`, case-insensitively, as a substring.
    pub fn first_match(&self, text: &str) -> Option<&str> {
        let text = text.to_lowercase();
        self.terms
            .iter()
            .find(|term| text.contains(term.as_str()))
            .map(String::as_str)
    }

    pub fn matches(&self, text: &str) -> bool {
        self.first_match(text).is_some()
    }
}

pub fn should_alert(text: &str, terms: &TriggerTerms) -> bool {
    terms.matches(text)
}

/// Frame and caption handed to the notifier once a trigger term fired.
#[derive(Debug, Clone)]
pub struct AlertEvent {
    pub jpeg: Vec<u8>,
    pub caption: String,
}
