use crate::error::WireError;
use crate::event::Event;
use crate::framing::FrameDecoder;

/// Incremental decoder from raw body bytes to [`Event`]s.
#[derive(Debug, Default)]
pub struct EventDecoder {
    frames: FrameDecoder,
}

impl EventDecoder {
    pub fn new(frames: FrameDecoder) -> Self {
        Self { frames }
    }

    pub fn extend(&mut self, chunk: &[u8]) {
        self.frames.extend(chunk);
    }

    /// Next complete event, if one is buffered.
    pub fn next_event(&mut self) -> Result<Option<Event>, WireError> {
        match self.frames.next_frame()? {
            Some(frame) => Event::from_payload(&frame.data).map(Some),
            None => Ok(None),
        }
    }

    pub fn push(&mut self, chunk: &[u8]) -> Result<Vec<Event>, WireError> {
        self.extend(chunk);
        let mut events = Vec::new();
        while let Some(event) = self.next_event()? {
            events.push(event);
        }
        Ok(events)
    }

    pub fn finish(&mut self) -> Result<(), WireError> {
        self.frames.finish()
    }
}
