//! JSON payloads spoken on backend connections.
//!
//! Every message is a JSON object inside the length-prefixed, ack-interlocked
//! frame implemented in [`crate::backend::frame`]. Server-originated messages
//! carry a `todo` discriminator next to a field of the same name.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::index::{IndexSnapshot, NewFile};

/// First framed message on every backend connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Handshake {
    pub task: ConversationKind,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConversationKind {
    NewFileMessage,
    Index,
    FileDownload,
}

/// Server push announcing a new artifact.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewFilePush {
    pub todo: String,
    pub new_file: NewFile,
}

impl NewFilePush {
    pub fn new(record: NewFile) -> Self {
        Self {
            todo: "new_file".to_string(),
            new_file: record,
        }
    }
}

/// Client request for the current index.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IndexRequestMessage {
    pub todo: String,
}

/// Server reply carrying a full index snapshot.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IndexReply {
    pub todo: String,
    pub index: IndexSnapshot,
}

impl IndexReply {
    pub fn new(index: IndexSnapshot) -> Self {
        Self {
            todo: "index".to_string(),
            index,
        }
    }
}

/// Client request for one object's contents.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileRequest {
    pub requested_file: FileCoordinate,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileCoordinate {
    pub namespace: String,
    pub key: String,
}

/// Server reply to a file request. `contents` is the base64 encoding of the
/// raw object bytes; `tags` carries the full extended-attribute set.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileAnswer {
    pub todo: String,
    pub file_request: FileAnswerBody,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileAnswerBody {
    pub namespace: String,
    pub object: String,
    pub contents: String,
    pub tags: BTreeMap<String, String>,
}

impl FileAnswer {
    pub fn new(data: crate::cluster::ObjectData) -> Self {
        Self {
            todo: "file_request".to_string(),
            file_request: FileAnswerBody {
                namespace: data.namespace,
                object: data.object,
                contents: base64::encode(&data.contents),
                tags: data.tags,
            },
        }
    }
}
