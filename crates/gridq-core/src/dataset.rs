//! Dataset, work-packet, and output payload types
//!
//! The coordinator never looks inside query output or packet payloads; they
//! are opaque bytes produced and consumed by the execution layer. Datasets
//! carry just enough structure for validation and work distribution: a file
//! reference, an entry range, and a locality hint.

use serde::{Deserialize, Serialize};

/// One element of a dataset: a file (or object) plus an entry range
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DataElement {
    /// File the element lives in
    pub file: String,
    /// Object name within the file, if any
    pub object: String,
    /// First entry of the range
    pub first: u64,
    /// Number of entries, 0 meaning "to the end"
    pub num: u64,
    /// Host that holds the data locally, used as a placement hint
    pub host: String,
    /// Whether the element has been validated against the actual data
    pub valid: bool,
}

impl DataElement {
    /// Create an unvalidated element
    pub fn new(file: impl Into<String>, first: u64, num: u64) -> Self {
        Self {
            file: file.into(),
            object: String::new(),
            first,
            num,
            host: String::new(),
            valid: false,
        }
    }

    /// Set the locality hint
    pub fn on_host(mut self, host: impl Into<String>) -> Self {
        self.host = host.into();
        self
    }

    /// Key identifying this element within its dataset
    pub fn key(&self) -> (String, u64, u64) {
        (self.file.clone(), self.first, self.num)
    }
}

/// An ordered collection of data elements submitted as one unit of work
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Dataset {
    /// Elements in submission order
    pub elements: Vec<DataElement>,
}

impl Dataset {
    /// Create an empty dataset
    pub fn new() -> Self {
        Self::default()
    }

    /// Append an element
    pub fn add(&mut self, element: DataElement) {
        self.elements.push(element);
    }

    /// True when every element has been validated
    pub fn elements_valid(&self) -> bool {
        self.elements.iter().all(|e| e.valid)
    }

    /// Total number of entries across validated elements
    pub fn num_entries(&self) -> u64 {
        self.elements.iter().filter(|e| e.valid).map(|e| e.num).sum()
    }
}

/// A worker's request for the next unit of work
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PacketRequest {
    /// Entries the worker has processed since its last request
    pub processed: u64,
    /// Seconds the worker spent on the previous packet
    pub latency: f64,
}

/// A unit of work handed to one worker
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkPacket {
    /// File to read
    pub file: String,
    /// First entry
    pub first: u64,
    /// Number of entries
    pub num: u64,
}

/// One named piece of query output
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutputPart {
    /// Name the execution layer merges by
    pub name: String,
    /// Opaque payload
    pub bytes: Vec<u8>,
}

impl OutputPart {
    /// Create a part
    pub fn new(name: impl Into<String>, bytes: Vec<u8>) -> Self {
        Self { name: name.into(), bytes }
    }
}

/// Accumulated output of one query, a list of named opaque parts
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueryOutput {
    /// Parts in arrival order
    pub parts: Vec<OutputPart>,
}

impl QueryOutput {
    /// Create an empty output
    pub fn new() -> Self {
        Self::default()
    }

    /// True when no parts have been collected
    pub fn is_empty(&self) -> bool {
        self.parts.is_empty()
    }

    /// Find a part by name
    pub fn part(&self, name: &str) -> Option<&OutputPart> {
        self.parts.iter().find(|p| p.name == name)
    }
}

/// One named piece of intermediate feedback streamed during processing
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FeedbackPart {
    /// Name of the monitored object
    pub name: String,
    /// Opaque snapshot payload
    pub bytes: Vec<u8>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_dataset_validity() {
        let mut dset = Dataset::new();
        dset.add(DataElement::new("a.dat", 0, 100));
        dset.add(DataElement::new("b.dat", 0, 50));
        assert!(!dset.elements_valid());

        for e in &mut dset.elements {
            e.valid = true;
        }
        assert!(dset.elements_valid());
        assert_eq!(dset.num_entries(), 150);
    }

    #[test]
    fn test_output_part_lookup() {
        let mut out = QueryOutput::new();
        assert!(out.is_empty());

        out.parts.push(OutputPart::new("hist", vec![1, 2, 3]));
        assert_eq!(out.part("hist").map(|p| p.bytes.len()), Some(3));
        assert!(out.part("missing").is_none());
    }

    #[test]
    fn test_element_key() {
        let e = DataElement::new("a.dat", 10, 20).on_host("node1");
        assert_eq!(e.key(), ("a.dat".to_string(), 10, 20));
        assert_eq!(e.host, "node1");
    }
}
