use crate::metadata::MetadataMap;

/// A call's inbound or outbound request: the metadata carrier plus the message.
///
/// For streaming calls the message is a stream of messages.
#[derive(Debug)]
pub struct Request<T> {
    metadata: MetadataMap,
    message: T,
}

impl<T> Request<T> {
    pub fn new(message: T) -> Self {
        Self {
            metadata: MetadataMap::new(),
            message,
        }
    }

    /// Get a reference to the request metadata.
    pub fn metadata(&self) -> &MetadataMap {
        &self.metadata
    }

    /// Get a mutable reference to the request metadata.
    pub fn metadata_mut(&mut self) -> &mut MetadataMap {
        &mut self.metadata
    }

    pub fn into_parts(self) -> (MetadataMap, T) {
        (self.metadata, self.message)
    }
}
