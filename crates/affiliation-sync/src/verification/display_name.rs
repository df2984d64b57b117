/// Characters kept when a label has neither word breaks nor capitals.
const FALLBACK_ABBREVIATION_LEN: usize = 5;

/// Builds `account<separator>label` display names within the platform limit.
#[derive(Debug, Clone)]
pub struct DisplayNamePolicy {
    separator: String,
    max_len: usize,
}

impl DisplayNamePolicy {
    pub fn new(separator: impl Into<String>, max_len: usize) -> Self {
        Self {
            separator: separator.into(),
            max_len,
        }
    }

    /// Label following the separator in a current display name, if any.
    pub fn existing_label<'a>(&self, current: &'a str) -> Option<&'a str> {
        current
            .split(self.separator.as_str())
            .nth(1)
            .map(str::trim)
            .filter(|label| !label.is_empty())
    }

    /// Joins account and label, shrinking the label first and the account second.
    pub fn compose(&self, account: &str, label: &str) -> String {
        let full = format!("{account}{}{label}", self.separator);
        if char_len(&full) <= self.max_len {
            return full;
        }

        let short_label = abbreviate(label);
        let abbreviated = format!("{account}{}{short_label}", self.separator);
        if char_len(&abbreviated) <= self.max_len {
            return abbreviated;
        }

        let reserved = char_len(&self.separator) + char_len(&short_label);
        match self.max_len.checked_sub(reserved) {
            Some(room) if room > 0 => {
                format!("{}{}{short_label}", truncate(account, room), self.separator)
            }
            _ => truncate(account, self.max_len),
        }
    }
}

/// Initials of underscore-separated words, else capital letters, else a prefix.
pub fn abbreviate(label: &str) -> String {
    let words: Vec<&str> = label.split('_').filter(|word| !word.is_empty()).collect();
    if label.contains('_') && !words.is_empty() {
        return words
            .iter()
            .filter_map(|word| word.chars().next())
            .flat_map(char::to_uppercase)
            .map(String::from)
            .collect::<Vec<_>>()
            .join(".");
    }

    let capitals: Vec<String> = label
        .chars()
        .filter(char::is_ascii_uppercase)
        .map(String::from)
        .collect();
    if !capitals.is_empty() {
        return capitals.join(".");
    }

    truncate(label, FALLBACK_ABBREVIATION_LEN)
}

fn char_len(value: &str) -> usize {
    value.chars().count()
}

fn truncate(value: &str, max_chars: usize) -> String {
    value.chars().take(max_chars).collect()
}
