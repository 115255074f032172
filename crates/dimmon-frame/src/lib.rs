//! Data frames: immutable, shareable carriers of (sensor-id, bytes) datanodes
//! that flow along hooks.
//!
//! A [`DataFrame`] is reference-counted via [`std::rc::Rc`] — cloning a frame
//! *is* the "add a reference before dispatch" step the spec calls for
//! (invariant 8), so fan-out delivery is just `frame.clone()` per peer. The
//! wrapped [`std::cell::RefCell`] lets an author keep appending datanodes
//! until the frame is shared; once a second holder exists, structural
//! mutation is rejected rather than silently racing receivers that may be
//! mid-dispatch.

use dimmon_error::{DmmError, DmmResult};
use std::cell::RefCell;
use std::rc::Rc;

/// One (sensor-id, bytes) record inside a frame. `sensor_id` is always
/// nonzero here; the zero/zero-length terminator is implicit framing and
/// never materialized as a `DataNode`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DataNode {
    pub sensor_id: u32,
    pub payload: Vec<u8>,
}

#[derive(Debug, Default)]
struct FrameInner {
    nodes: Vec<DataNode>,
}

/// A reference-counted data frame. Cheap to clone (`Rc` bump); see the module
/// docs for the single-owner resize rule.
#[derive(Debug, Clone)]
pub struct DataFrame(Rc<RefCell<FrameInner>>);

impl DataFrame {
    /// Allocates a frame with room for `num_nodes` datanodes totalling
    /// roughly `payload_bytes` of payload. Mirrors the original allocator's
    /// `(n+1) * sizeof(header) + payload_bytes` reservation, minus the
    /// terminator slot which this representation never stores explicitly.
    pub fn with_capacity(num_nodes: usize, payload_bytes: usize) -> Self {
        let mut nodes = Vec::with_capacity(num_nodes);
        nodes.reserve_exact(0);
        let _ = payload_bytes; // informational only; Vec<DataNode> owns its bytes per-node
        DataFrame(Rc::new(RefCell::new(FrameInner { nodes })))
    }

    /// True while this frame has exactly one owner, i.e. it is still safe to
    /// mutate its structure in place.
    pub fn is_unique(&self) -> bool {
        Rc::strong_count(&self.0) == 1
    }

    /// Appends a datanode. Fails with [`DmmError::InvalidArgument`] if
    /// `sensor_id` is zero (reserved for the terminator) and with
    /// [`DmmError::NotSupported`] once the frame has been shared with a
    /// second owner (see module docs).
    pub fn push(&self, sensor_id: u32, payload: impl Into<Vec<u8>>) -> DmmResult<()> {
        if sensor_id == 0 {
            return Err(DmmError::InvalidArgument);
        }
        if !self.is_unique() {
            return Err(DmmError::NotSupported);
        }
        self.0.borrow_mut().nodes.push(DataNode {
            sensor_id,
            payload: payload.into(),
        });
        Ok(())
    }

    pub fn datanode_count(&self) -> usize {
        self.0.borrow().nodes.len()
    }

    /// Runs `f` over a snapshot clone of the datanodes. Avoids holding the
    /// `RefCell` borrow across caller code that might itself try to mutate
    /// the frame.
    pub fn for_each<F: FnMut(&DataNode)>(&self, mut f: F) {
        for node in self.0.borrow().nodes.iter() {
            f(node);
        }
    }

    pub fn nodes_snapshot(&self) -> Vec<DataNode> {
        self.0.borrow().nodes.clone()
    }

    /// Serializes to the wire format used in-process and by network
    /// endpoints: `{u32 sensor_id; u32 length; u8 payload[length]}*`
    /// terminated by a zero/zero record, all fields little-endian.
    pub fn to_wire(&self) -> Vec<u8> {
        let inner = self.0.borrow();
        let mut out = Vec::new();
        for node in inner.nodes.iter() {
            out.extend_from_slice(&node.sensor_id.to_le_bytes());
            out.extend_from_slice(&(node.payload.len() as u32).to_le_bytes());
            out.extend_from_slice(&node.payload);
        }
        out.extend_from_slice(&0u32.to_le_bytes());
        out.extend_from_slice(&0u32.to_le_bytes());
        out
    }

    /// Parses the wire format produced by [`DataFrame::to_wire`]. Rejects
    /// truncated input and any record whose length field would overflow the
    /// remaining buffer (the overflow case the original left unspecified).
    pub fn from_wire(bytes: &[u8]) -> DmmResult<Self> {
        let mut nodes = Vec::new();
        let mut cursor = 0usize;
        loop {
            let header = bytes
                .get(cursor..cursor.checked_add(8).ok_or(DmmError::InvalidArgument)?)
                .ok_or(DmmError::InvalidArgument)?;
            let sensor_id = u32::from_le_bytes(header[0..4].try_into().unwrap());
            let length = u32::from_le_bytes(header[4..8].try_into().unwrap());
            cursor += 8;

            if sensor_id == 0 && length == 0 {
                break;
            }
            let len = length as usize;
            let end = cursor.checked_add(len).ok_or(DmmError::InvalidArgument)?;
            let payload = bytes.get(cursor..end).ok_or(DmmError::InvalidArgument)?.to_vec();
            cursor = end;
            nodes.push(DataNode { sensor_id, payload });
        }
        Ok(DataFrame(Rc::new(RefCell::new(FrameInner { nodes }))))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn push_rejects_zero_sensor_id() {
        let frame = DataFrame::with_capacity(1, 8);
        assert_eq!(frame.push(0, vec![1, 2]), Err(DmmError::InvalidArgument));
    }

    #[test]
    fn push_rejected_once_shared() {
        let frame = DataFrame::with_capacity(1, 8);
        frame.push(42, b"hi".to_vec()).unwrap();
        let _clone = frame.clone();
        assert_eq!(frame.is_unique(), false);
        assert_eq!(frame.push(7, b"no".to_vec()), Err(DmmError::NotSupported));
    }

    #[test]
    fn wire_round_trip() {
        let frame = DataFrame::with_capacity(2, 8);
        frame.push(42, b"hi".to_vec()).unwrap();
        frame.push(7, Vec::new()).unwrap();
        let wire = frame.to_wire();
        let parsed = DataFrame::from_wire(&wire).unwrap();
        assert_eq!(parsed.datanode_count(), 2);
        let nodes = parsed.nodes_snapshot();
        assert_eq!(nodes[0].sensor_id, 42);
        assert_eq!(nodes[0].payload, b"hi");
        assert_eq!(nodes[1].sensor_id, 7);
        assert!(nodes[1].payload.is_empty());
    }

    #[test]
    fn from_wire_rejects_truncated_record() {
        let mut bytes = 42u32.to_le_bytes().to_vec();
        bytes.extend_from_slice(&5u32.to_le_bytes()); // claims 5 bytes payload
        bytes.extend_from_slice(b"hi"); // only 2 present
        assert_eq!(DataFrame::from_wire(&bytes), Err(DmmError::InvalidArgument));
    }

    #[test]
    fn from_wire_rejects_length_overflow() {
        let mut bytes = 42u32.to_le_bytes().to_vec();
        bytes.extend_from_slice(&u32::MAX.to_le_bytes());
        assert_eq!(DataFrame::from_wire(&bytes), Err(DmmError::InvalidArgument));
    }

    #[test]
    fn clone_shares_storage() {
        let frame = DataFrame::with_capacity(1, 8);
        frame.push(1, b"x".to_vec()).unwrap();
        let shared = frame.clone();
        assert_eq!(shared.datanode_count(), 1);
    }
}
