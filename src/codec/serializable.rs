//! Values that can live in the durable store.

use super::event_codec;
use super::value::PlistValue;
use super::CodecError;
use crate::event::Event;

/// A value with a property-list representation.
///
/// `from_plist` returns `Ok(None)` when the input is not a representation
/// of `Self`, and an error only for data that must not be silently skipped.
pub trait PropertyListSerializable: Sized {
    fn to_plist(&self) -> PlistValue;

    fn from_plist(value: &PlistValue) -> Result<Option<Self>, CodecError>;

    /// Number of elements discarded while decoding this value.
    fn dropped_on_decode(&self) -> usize {
        0
    }
}

impl PropertyListSerializable for u64 {
    fn to_plist(&self) -> PlistValue {
        PlistValue::Integer(i64::try_from(*self).unwrap_or(i64::MAX))
    }

    fn from_plist(value: &PlistValue) -> Result<Option<Self>, CodecError> {
        Ok(value.as_integer().and_then(|i| u64::try_from(i).ok()))
    }
}

impl PropertyListSerializable for Event {
    fn to_plist(&self) -> PlistValue {
        event_codec::encode(self)
    }

    fn from_plist(value: &PlistValue) -> Result<Option<Self>, CodecError> {
        event_codec::decode(value)
    }
}

/// Ordered events, newest first, as stored under the event log key.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct EventSequence {
    events: Vec<Event>,
    dropped: usize,
}

impl EventSequence {
    pub fn new(events: Vec<Event>) -> Self {
        Self { events, dropped: 0 }
    }

    pub fn events(&self) -> &[Event] {
        &self.events
    }

    pub fn into_events(self) -> Vec<Event> {
        self.events
    }

    pub fn len(&self) -> usize {
        self.events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }

    /// Insert at index 0.
    pub fn push_front(&mut self, event: Event) {
        self.events.insert(0, event);
    }

    pub fn clear(&mut self) {
        self.events.clear();
    }
}

impl PropertyListSerializable for EventSequence {
    fn to_plist(&self) -> PlistValue {
        PlistValue::Array(self.events.iter().map(event_codec::encode).collect())
    }

    fn from_plist(value: &PlistValue) -> Result<Option<Self>, CodecError> {
        let Some(items) = value.as_array() else {
            return Ok(None);
        };

        let mut events = Vec::with_capacity(items.len());
        let mut dropped = 0;
        for item in items {
            match event_codec::decode(item)? {
                Some(event) => events.push(event),
                None => dropped += 1,
            }
        }

        Ok(Some(Self { events, dropped }))
    }

    fn dropped_on_decode(&self) -> usize {
        self.dropped
    }
}
