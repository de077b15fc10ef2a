use indexmap::IndexMap;
use serde::{Deserialize, Serialize};

/// Ordered collection of 2D fields captured at snapshot steps.
///
/// Frames are keyed `frame_0`, `frame_1`, ... in capture order with no gaps.
/// Each frame is row-major with shape (ny, nx): element `row * nx + col`,
/// row 0 being the bottom wall and column 0 the inlet.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FieldArchive {
    pub nx: usize,
    pub ny: usize,
    /// Step at which each frame was captured, parallel to `frames`.
    pub steps: Vec<u64>,
    pub frames: IndexMap<String, Vec<f64>>,
}

impl FieldArchive {
    pub fn new(nx: usize, ny: usize) -> Self {
        Self { nx, ny, steps: Vec::new(), frames: IndexMap::new() }
    }

    /// Key under which frame `index` is stored.
    pub fn frame_key(index: usize) -> String {
        format!("frame_{}", index)
    }

    /// Appends a frame under the next free key.
    pub fn push(&mut self, step: u64, data: Vec<f64>) {
        debug_assert_eq!(data.len(), self.nx * self.ny);
        let key = Self::frame_key(self.frames.len());
        self.steps.push(step);
        self.frames.insert(key, data);
    }

    pub fn len(&self) -> usize {
        self.frames.len()
    }

    pub fn is_empty(&self) -> bool {
        self.frames.is_empty()
    }

    pub fn frame(&self, index: usize) -> Option<&[f64]> {
        self.frames.get(&Self::frame_key(index)).map(Vec::as_slice)
    }

    pub fn last_frame(&self) -> Option<&[f64]> {
        self.frames.last().map(|(_, data)| data.as_slice())
    }
}

/// One row of the residual log.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ResidualRecord {
    #[serde(rename = "Step")]
    pub step: u64,
    #[serde(rename = "Residual")]
    pub residual: f64,
}
