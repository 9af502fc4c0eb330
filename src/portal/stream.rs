//! Stream metadata returned by `Start`.

use std::collections::HashMap;

use zbus::zvariant::{OwnedValue, Value};

use crate::error::{PortalError, Result};
use crate::portal::Results;

/// A PipeWire stream negotiated by the portal.
#[derive(Debug, PartialEq)]
pub struct StreamDescriptor {
    /// PipeWire node ID.
    pub node_id: u32,
    /// Stream properties as sent by the portal (`id`, `size`, `source_type`...).
    pub properties: Results,
}

impl StreamDescriptor {
    pub fn new(node_id: u32, properties: Results) -> Self {
        Self {
            node_id,
            properties,
        }
    }

    /// Opaque stream identifier, stable across restored sessions.
    pub fn id(&self) -> Option<String> {
        self.string_property("id")
    }

    pub fn mapping_id(&self) -> Option<String> {
        self.string_property("mapping_id")
    }

    /// Source type bit (`SOURCE_TYPE_*`) of the captured source.
    pub fn source_type(&self) -> Option<u32> {
        self.properties
            .get("source_type")
            .and_then(|value| u32::try_from(value).ok())
    }

    pub fn position(&self) -> Option<(i32, i32)> {
        self.pair_property("position")
    }

    pub fn size(&self) -> Option<(i32, i32)> {
        self.pair_property("size")
    }

    fn string_property(&self, key: &str) -> Option<String> {
        match &**self.properties.get(key)? {
            Value::Str(s) => Some(s.to_string()),
            _ => None,
        }
    }

    fn pair_property(&self, key: &str) -> Option<(i32, i32)> {
        self.properties
            .get(key)
            .and_then(|value| value.try_clone().ok())
            .and_then(|owned| <(i32, i32)>::try_from(owned).ok())
    }
}

/// Decodes the `streams` entry (`a(ua{sv})`) of a `Start` response.
///
/// A missing entry yields an empty list.
pub fn parse_streams(results: &Results) -> Result<Vec<StreamDescriptor>> {
    let Some(streams) = results.get("streams") else {
        return Ok(Vec::new());
    };

    let value: Value = streams.try_clone().map_err(decode_err)?.into();
    let entries: Vec<(u32, HashMap<String, OwnedValue>)> =
        value.try_into().map_err(decode_err)?;

    Ok(entries
        .into_iter()
        .map(|(node_id, properties)| StreamDescriptor::new(node_id, properties))
        .collect())
}

fn decode_err(source: zbus::zvariant::Error) -> PortalError {
    PortalError::Decode {
        what: "streams",
        source,
    }
}

#[cfg(test)]
mod tests {
    use zbus::zvariant::Str;

    use super::*;
    use crate::portal::SOURCE_TYPE_WINDOW;

    fn streams_value(entries: Vec<(u32, HashMap<String, OwnedValue>)>) -> OwnedValue {
        OwnedValue::try_from(Value::new(entries)).unwrap()
    }

    #[test]
    fn first_stream_keeps_its_properties() {
        let mut props = HashMap::new();
        props.insert(
            "id".to_string(),
            OwnedValue::from(Str::from("window-7".to_string())),
        );
        props.insert("source_type".to_string(), OwnedValue::from(SOURCE_TYPE_WINDOW));
        props.insert(
            "size".to_string(),
            OwnedValue::try_from(Value::new((1280i32, 720i32))).unwrap(),
        );
        props.insert(
            "position".to_string(),
            OwnedValue::try_from(Value::new((-40i32, 16i32))).unwrap(),
        );

        let mut results = Results::new();
        results.insert(
            "streams".to_string(),
            streams_value(vec![(42, props), (43, HashMap::new())]),
        );

        let streams = parse_streams(&results).unwrap();
        assert_eq!(streams.len(), 2);
        assert_eq!(streams[0].node_id, 42);
        assert_eq!(streams[0].id().as_deref(), Some("window-7"));
        assert_eq!(streams[0].source_type(), Some(SOURCE_TYPE_WINDOW));
        assert_eq!(streams[0].size(), Some((1280, 720)));
        assert_eq!(streams[0].position(), Some((-40, 16)));
        assert_eq!(streams[0].mapping_id(), None);
        assert_eq!(streams[1].position(), None);
    }

    #[test]
    fn mapping_id_is_read_as_a_string() {
        let mut props = HashMap::new();
        props.insert(
            "mapping_id".to_string(),
            OwnedValue::from(Str::from("monitor-HDMI-1".to_string())),
        );
        props.insert("id".to_string(), OwnedValue::from(3u32));

        let stream = StreamDescriptor::new(5, props);
        assert_eq!(stream.mapping_id().as_deref(), Some("monitor-HDMI-1"));
        // A non-string id is ignored rather than misread.
        assert_eq!(stream.id(), None);
    }

    #[test]
    fn missing_streams_entry_is_empty() {
        assert!(parse_streams(&Results::new()).unwrap().is_empty());
    }

    #[test]
    fn wrong_streams_type_is_a_decode_error() {
        let mut results = Results::new();
        results.insert("streams".to_string(), OwnedValue::from(7u32));

        assert!(matches!(
            parse_streams(&results),
            Err(PortalError::Decode { what: "streams", .. })
        ));
    }
}
