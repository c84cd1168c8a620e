use kubetap_types::Error;

/// Include/exclude substring filter applied to every log line
///
/// Exclude wins: a line containing any exclude substring is dropped even if
/// it also contains an include substring.
#[derive(Clone, Default)]
pub struct LineFilter {
    /// Substrings of which at least one must occur (empty = all)
    include: Vec<String>,

    /// Substrings of which none may occur
    exclude: Vec<String>,
}

impl LineFilter {
    /// Build a filter, rejecting empty or contradictory substrings
    pub fn new<I, E>(include: I, exclude: E) -> Result<Self, Error>
    where
        I: IntoIterator,
        I::Item: Into<String>,
        E: IntoIterator,
        E::Item: Into<String>,
    {
        let include: Vec<String> = include.into_iter().map(Into::into).collect();
        let exclude: Vec<String> = exclude.into_iter().map(Into::into).collect();

        if include.iter().any(|s| s.is_empty()) {
            return Err(Error::FilterConfig(
                "include filters must not be empty".to_string(),
            ));
        }
        if exclude.iter().any(|s| s.is_empty()) {
            return Err(Error::FilterConfig(
                "exclude filters must not be empty".to_string(),
            ));
        }
        if let Some(both) = include.iter().find(|s| exclude.contains(*s)) {
            return Err(Error::FilterConfig(format!(
                "'{}' is both included and excluded",
                both
            )));
        }

        Ok(Self { include, exclude })
    }

    /// Check if a line passes this filter
    pub fn matches(&self, line: &str) -> bool {
        if self.exclude.iter().any(|s| line.contains(s.as_str())) {
            return false;
        }
        self.include.is_empty() || self.include.iter().any(|s| line.contains(s.as_str()))
    }

    /// Byte ranges of include matches, sorted and merged (for highlighting)
    pub fn find_matches(&self, text: &str) -> Vec<(usize, usize)> {
        let mut ranges: Vec<(usize, usize)> = self
            .include
            .iter()
            .flat_map(|needle| {
                text.match_indices(needle.as_str())
                    .map(|(start, m)| (start, start + m.len()))
            })
            .collect();
        ranges.sort_unstable();

        let mut merged: Vec<(usize, usize)> = Vec::with_capacity(ranges.len());
        for (start, end) in ranges {
            match merged.last_mut() {
                Some(last) if start <= last.1 => last.1 = last.1.max(end),
                _ => merged.push((start, end)),
            }
        }
        merged
    }

    pub fn include(&self) -> &[String] {
        &self.include
    }

    pub fn exclude(&self) -> &[String] {
        &self.exclude
    }

    /// Check if filter is empty (matches everything)
    pub fn is_empty(&self) -> bool {
        self.include.is_empty() && self.exclude.is_empty()
    }
}

impl std::fmt::Debug for LineFilter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LineFilter")
            .field("include", &self.include)
            .field("exclude", &self.exclude)
            .finish()
    }
}
