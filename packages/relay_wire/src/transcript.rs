//! Consumer-side reconstruction of the assistant message.

use crate::error::WireError;
use crate::event::Event;

/// The running assistant message built from decoded events.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct Transcript {
    text: String,
    fragments: usize,
    completed: bool,
}

impl Transcript {
    /// Apply one event. Anything after the terminator is rejected.
    pub fn apply(&mut self, event: &Event) -> Result<(), WireError> {
        if self.completed {
            return Err(WireError::EventAfterTerminator);
        }
        match event {
            Event::Fragment(fragment) => {
                self.text.push_str(&fragment.content);
                self.fragments += 1;
            }
            Event::Terminator => self.completed = true,
        }
        Ok(())
    }

    pub fn text(&self) -> &str {
        &self.text
    }

    pub fn into_text(self) -> String {
        self.text
    }

    pub fn fragment_count(&self) -> usize {
        self.fragments
    }

    /// True once the terminator has been applied.
    pub fn is_complete(&self) -> bool {
        self.completed
    }

    pub fn reconstruct<'a>(events: impl IntoIterator<Item = &'a Event>) -> Result<Self, WireError> {
        let mut transcript = Self::default();
        for event in events {
            transcript.apply(event)?;
        }
        Ok(transcript)
    }
}
