use thiserror::Error;
use yrs::updates::decoder::Decode;
use yrs::updates::encoder::Encode;
use yrs::{
    Any, Doc, GetString, Map, MapRef, Out, ReadTxn, StateVector, Text, TextRef, Transact, Update,
    XmlElementPrelim, XmlFragment, XmlFragmentRef, XmlTextPrelim,
};

use crate::payload::{check_state_vector_v1, check_update_v1};

/// Name of the root text holding the document title
pub const TITLE_FIELD: &str = "title";
/// Name of the root fragment holding the rich-text body
pub const CONTENT_FIELD: &str = "content";
/// Name of the root map where older clients keep a `title` entry
pub const META_FIELD: &str = "meta";

/// Errors raised while merging or diffing CRDT state
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DocumentError {
    #[error("Malformed update: {0}")]
    MalformedUpdate(String),

    #[error("Failed to apply update: {0}")]
    Apply(String),

    #[error("Malformed state vector: {0}")]
    MalformedStateVector(String),
}

/// The in-memory replicated document shared by every session of one id.
///
/// Thin wrapper over a yrs `Doc` exposing only the operations the relay and
/// the persistence bridge need. Merge semantics come from yrs: applying an
/// update is idempotent, commutative and associative.
pub struct SharedDocument {
    doc: Doc,
    title: TextRef,
    content: XmlFragmentRef,
    meta: MapRef,
}

impl SharedDocument {
    pub fn new() -> Self {
        Self::from_doc(Doc::new())
    }

    /// Create a document with a fixed replica id (simulated clients, tests)
    pub fn with_client_id(client_id: u64) -> Self {
        Self::from_doc(Doc::with_client_id(client_id))
    }

    fn from_doc(doc: Doc) -> Self {
        let title = doc.get_or_insert_text(TITLE_FIELD);
        let content = doc.get_or_insert_xml_fragment(CONTENT_FIELD);
        let meta = doc.get_or_insert_map(META_FIELD);
        Self {
            doc,
            title,
            content,
            meta,
        }
    }

    /// Merge a v1-encoded update into this document.
    ///
    /// The payload is bounds-checked before decoding; forged lengths are
    /// rejected as `MalformedUpdate`.
    pub fn apply_update(&self, update: &[u8]) -> Result<(), DocumentError> {
        check_update_v1(update).map_err(|e| DocumentError::MalformedUpdate(e.to_string()))?;
        let update =
            Update::decode_v1(update).map_err(|e| DocumentError::MalformedUpdate(e.to_string()))?;
        let mut txn = self.doc.transact_mut();
        txn.apply_update(update)
            .map_err(|e| DocumentError::Apply(e.to_string()))?;
        Ok(())
    }

    /// Encode the full document state as a single v1 update
    pub fn encode_state(&self) -> Vec<u8> {
        let txn = self.doc.transact();
        txn.encode_state_as_update_v1(&StateVector::default())
    }

    /// Encode this replica's state vector
    pub fn state_vector(&self) -> Vec<u8> {
        let txn = self.doc.transact();
        txn.state_vector().encode_v1()
    }

    /// Encode everything a peer with the given state vector is missing
    pub fn encode_diff(&self, state_vector: &[u8]) -> Result<Vec<u8>, DocumentError> {
        check_state_vector_v1(state_vector)
            .map_err(|e| DocumentError::MalformedStateVector(e.to_string()))?;
        let sv = StateVector::decode_v1(state_vector)
            .map_err(|e| DocumentError::MalformedStateVector(e.to_string()))?;
        let txn = self.doc.transact();
        Ok(txn.encode_diff_v1(&sv))
    }

    /// Current title as collaboratively edited
    pub fn title(&self) -> String {
        let txn = self.doc.transact();
        self.title.get_string(&txn)
    }

    /// Replace the title in a single transaction
    pub fn set_title(&self, title: &str) {
        let mut txn = self.doc.transact_mut();
        let len = self.title.len(&txn);
        if len > 0 {
            self.title.remove_range(&mut txn, 0, len);
        }
        if !title.is_empty() {
            self.title.insert(&mut txn, 0, title);
        }
    }

    /// `meta.title`, when set to a string
    pub fn meta_title(&self) -> Option<String> {
        let txn = self.doc.transact();
        match self.meta.get(&txn, "title") {
            Some(Out::Any(Any::String(title))) => Some(title.to_string()),
            _ => None,
        }
    }

    pub fn set_meta_title(&self, title: &str) {
        let mut txn = self.doc.transact_mut();
        self.meta.insert(&mut txn, "title", title.to_string());
    }

    /// XML rendering of the rich-text body
    pub fn content(&self) -> String {
        let txn = self.doc.transact();
        self.content.get_string(&txn)
    }

    /// Append a paragraph holding `text` to the body
    pub fn append_paragraph(&self, text: &str) {
        let mut txn = self.doc.transact_mut();
        let paragraph = self
            .content
            .push_back(&mut txn, XmlElementPrelim::empty("paragraph"));
        paragraph.push_back(&mut txn, XmlTextPrelim::new(text));
    }

    /// True when title, body and meta are all empty
    pub fn is_empty(&self) -> bool {
        let txn = self.doc.transact();
        self.title.len(&txn) == 0 && self.content.len(&txn) == 0 && self.meta.len(&txn) == 0
    }
}

impl Default for SharedDocument {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for SharedDocument {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SharedDocument")
            .field("title", &self.title())
            .field("content", &self.content())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn edited(client_id: u64, title: &str, paragraph: &str) -> SharedDocument {
        let doc = SharedDocument::with_client_id(client_id);
        doc.set_title(title);
        doc.append_paragraph(paragraph);
        doc
    }

    #[test]
    fn test_new_document_is_empty() {
        let doc = SharedDocument::new();
        assert!(doc.is_empty());
        assert_eq!(doc.title(), "");
        assert_eq!(doc.content(), "");
    }

    #[test]
    fn test_apply_snapshot_twice_is_idempotent() {
        let source = edited(1, "Meeting notes", "first item");
        let snapshot = source.encode_state();

        let once = SharedDocument::with_client_id(10);
        once.apply_update(&snapshot).unwrap();

        let twice = SharedDocument::with_client_id(11);
        twice.apply_update(&snapshot).unwrap();
        twice.apply_update(&snapshot).unwrap();

        assert_eq!(once.title(), twice.title());
        assert_eq!(once.content(), twice.content());
        assert_eq!(twice.title(), "Meeting notes");
    }

    #[test]
    fn test_merge_is_commutative() {
        let a = edited(1, "", "from alice").encode_state();
        let b = edited(2, "", "from bob").encode_state();

        let ab = SharedDocument::with_client_id(10);
        ab.apply_update(&a).unwrap();
        ab.apply_update(&b).unwrap();

        let ba = SharedDocument::with_client_id(11);
        ba.apply_update(&b).unwrap();
        ba.apply_update(&a).unwrap();

        assert_eq!(ab.content(), ba.content());
        assert!(ab.content().contains("from alice"));
        assert!(ab.content().contains("from bob"));
    }

    #[test]
    fn test_encode_diff_carries_only_missing_changes() {
        let server = edited(1, "Title", "shared");
        let client = SharedDocument::with_client_id(2);
        client.apply_update(&server.encode_state()).unwrap();

        server.append_paragraph("later");
        let diff = server.encode_diff(&client.state_vector()).unwrap();
        client.apply_update(&diff).unwrap();

        assert_eq!(client.content(), server.content());
    }

    #[test]
    fn test_set_title_replaces_previous_value() {
        let doc = SharedDocument::new();
        doc.set_title("Draft");
        doc.set_title("Final");
        assert_eq!(doc.title(), "Final");
        doc.set_title("");
        assert_eq!(doc.title(), "");
    }

    #[test]
    fn test_meta_title_travels_with_state() {
        let source = SharedDocument::with_client_id(5);
        assert_eq!(source.meta_title(), None);
        source.set_meta_title("Legacy title");

        let replica = SharedDocument::new();
        replica.apply_update(&source.encode_state()).unwrap();
        assert_eq!(replica.meta_title().as_deref(), Some("Legacy title"));
        assert_eq!(replica.title(), "");
    }

    #[test]
    fn test_malformed_update_rejected() {
        let doc = SharedDocument::new();
        let err = doc.apply_update(&[0xFF, 0xFF, 0xFF]).unwrap_err();
        assert!(matches!(
            err,
            DocumentError::MalformedUpdate(_) | DocumentError::Apply(_)
        ));
    }

    #[test]
    fn test_malformed_state_vector_rejected() {
        let doc = SharedDocument::new();
        assert!(doc.encode_diff(&[0xFF, 0xFF, 0xFF]).is_err());
    }
}
