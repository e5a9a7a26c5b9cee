use ip_tools::Confirmation;
use std::collections::HashSet;

/// Confirmation tuples already shown to the user during one agent run.
///
/// Lives on the stack of a single request; nothing is shared between requests.
#[derive(Debug, Default)]
pub struct ConfirmationDeduplicator {
    seen: HashSet<String>,
}

impl ConfirmationDeduplicator {
    /// Records the tuple and reports whether this is the first time it was seen.
    pub fn first_sighting(&mut self, confirmation: &Confirmation) -> ip_tools::Result<bool> {
        Ok(self.seen.insert(confirmation.key()?))
    }

    pub fn shown_count(&self) -> usize {
        self.seen.len()
    }
}
