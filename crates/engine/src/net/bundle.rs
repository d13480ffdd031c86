use super::bitstream::{BitError, BitStream};

/// A single user-defined event carried inside a bundle.
#[derive(Debug, Clone, PartialEq)]
pub struct NetEvent {
    pub name: String,
    pub data: BitStream,
}

/// An ordered set of user events packed into protocol messages. At most one
/// event of a given name may be present.
///
/// The bundle is held in one of two forms, whichever was produced last: the
/// decoded event list or the packed bitstream. Conversion happens lazily and
/// a dirty flag tracks which form is current.
#[derive(Debug, Clone, Default)]
pub struct EventBundle {
    events: Vec<NetEvent>,
    stream: BitStream,
    stream_dirty: bool,
    events_dirty: bool,
}

impl EventBundle {
    pub fn new() -> Self {
        Self::default()
    }

    /// Wraps an already-packed bundle received off the wire. Events are
    /// decoded on first access.
    pub fn from_stream(stream: BitStream) -> Self {
        Self {
            events: Vec::new(),
            stream,
            stream_dirty: false,
            events_dirty: true,
        }
    }

    /// Adds an event. Returns false if an event of that name already exists.
    pub fn add(&mut self, name: impl Into<String>, data: BitStream) -> bool {
        if self.events_dirty {
            self.decode_events();
        }
        let name = name.into();
        if self.events.iter().any(|event| event.name == name) {
            return false;
        }
        self.events.push(NetEvent { name, data });
        self.stream_dirty = true;
        true
    }

    pub fn get(&mut self, name: &str) -> Option<&NetEvent> {
        if self.events_dirty {
            self.decode_events();
        }
        self.events.iter().find(|event| event.name == name)
    }

    pub fn events(&mut self) -> &[NetEvent] {
        if self.events_dirty {
            self.decode_events();
        }
        &self.events
    }

    pub fn len(&mut self) -> usize {
        self.events().len()
    }

    pub fn is_empty(&mut self) -> bool {
        self.events().is_empty()
    }

    /// The packed form, re-encoded if events changed since the last call.
    pub fn as_stream(&mut self) -> &BitStream {
        if self.stream_dirty {
            let mut stream = BitStream::new();
            stream.write_u8(self.events.len() as u8);
            for event in &self.events {
                stream.write_string(&event.name);
                if let Err(error) = stream.write_sized_stream(&event.data) {
                    // Keep the framing intact; the payload is replaced by an
                    // empty stream.
                    log::warn!("truncating oversized event {}: {error}", event.name);
                    let _ = stream.write_sized_stream(&BitStream::new());
                }
            }
            self.stream = stream;
            self.stream_dirty = false;
        }
        &self.stream
    }

    fn decode_events(&mut self) {
        self.events_dirty = false;
        self.events.clear();
        let mut stream = self.stream.clone();
        stream.reset_read();
        if let Err(error) = Self::decode_into(&mut stream, &mut self.events) {
            log::warn!("discarding malformed event bundle: {error}");
            self.events.clear();
        }
    }

    fn decode_into(stream: &mut BitStream, events: &mut Vec<NetEvent>) -> Result<(), BitError> {
        if stream.bits_remaining() == 0 {
            return Ok(());
        }
        let count = stream.read_u8()?;
        for _ in 0..count {
            let name = stream.read_string()?;
            let data = stream.read_sized_stream()?;
            events.push(NetEvent { name, data });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trip_through_stream() {
        let mut bundle = EventBundle::new();
        let mut payload = BitStream::new();
        payload.write_string("alice");
        assert!(bundle.add("NameChanged", payload));
        assert!(bundle.add("Ready", BitStream::new()));

        let packed = bundle.as_stream().clone();
        let mut decoded = EventBundle::from_stream(packed);
        assert_eq!(decoded.len(), 2);
        let mut data = decoded.get("NameChanged").unwrap().data.clone();
        assert_eq!(data.read_string().unwrap(), "alice");
    }

    #[test]
    fn duplicate_names_rejected() {
        let mut bundle = EventBundle::new();
        assert!(bundle.add("Ping", BitStream::new()));
        assert!(!bundle.add("Ping", BitStream::new()));
        assert_eq!(bundle.len(), 1);
    }

    #[test]
    fn empty_stream_decodes_to_no_events() {
        let mut bundle = EventBundle::from_stream(BitStream::new());
        assert!(bundle.is_empty());
    }
}
