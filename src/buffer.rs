use std::collections::HashMap;

use ndarray::{s, Array2};

use crate::{PolicyErr, Result};

/// The vector observations of every experience row.
pub const VECTOR_OBS: &str = "vector_obs";

/// The actions taken in every experience row.
pub const ACTIONS: &str = "actions";

/// The key of the flattened frames of the `i`-th camera.
pub fn visual_obs_key(i: usize) -> String {
    format!("visual_obs{i}")
}

/// A batch of experience: every field holds one row per experience, all fields have the same
/// amount of rows.
#[derive(Debug, Default, Clone)]
pub struct Batch {
    fields: HashMap<String, Array2<f32>>,
    len: usize,
}

impl Batch {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds or replaces a field.
    ///
    /// # Arguments
    /// * `key` - The field's name.
    /// * `rows` - The field's values, one row per experience.
    ///
    /// # Returns
    /// An error if the amount of rows differs from the other fields'.
    pub fn insert(&mut self, key: impl Into<String>, rows: Array2<f32>) -> Result<()> {
        let key = key.into();
        let others = self.fields.keys().any(|k| *k != key);

        if others && rows.nrows() != self.len {
            return Err(PolicyErr::ShapeMismatch {
                what: "batch field rows",
                got: rows.nrows(),
                expected: self.len,
            });
        }

        self.len = rows.nrows();
        self.fields.insert(key, rows);
        Ok(())
    }

    /// Returns a field.
    ///
    /// # Returns
    /// A `PolicyErr::MissingBatchField` error if there's no field with that name.
    pub fn get(&self, key: &str) -> Result<&Array2<f32>> {
        self.fields
            .get(key)
            .ok_or_else(|| PolicyErr::MissingBatchField {
                key: key.to_string(),
            })
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.fields.keys().map(String::as_str)
    }

    /// Returns the amount of rows in the batch.
    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Copies the rows `start..end` of every field into a new batch.
    ///
    /// # Returns
    /// An error if the range is empty or goes past the end of the batch.
    pub fn slice(&self, start: usize, end: usize) -> Result<Batch> {
        if start >= end || end > self.len {
            return Err(PolicyErr::ShapeMismatch {
                what: "batch slice end",
                got: end,
                expected: self.len,
            });
        }

        let fields = self
            .fields
            .iter()
            .map(|(k, v)| (k.clone(), v.slice(s![start..end, ..]).to_owned()))
            .collect();

        Ok(Batch {
            fields,
            len: end - start,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::array;

    fn batch() -> Batch {
        let mut batch = Batch::new();
        batch
            .insert(VECTOR_OBS, array![[0., 1.], [2., 3.], [4., 5.], [6., 7.]])
            .unwrap();
        batch
            .insert(ACTIONS, array![[0.], [1.], [0.], [1.]])
            .unwrap();
        batch
    }

    #[test]
    fn fields_share_row_count() {
        let mut batch = batch();
        assert_eq!(batch.len(), 4);
        assert!(matches!(
            batch.insert(visual_obs_key(0), Array2::zeros((3, 5))),
            Err(PolicyErr::ShapeMismatch { got: 3, expected: 4, .. })
        ));

        let mut keys: Vec<_> = batch.keys().collect();
        keys.sort();
        assert_eq!(keys, vec![ACTIONS, VECTOR_OBS]);
    }

    #[test]
    fn single_field_can_be_replaced() {
        let mut batch = Batch::new();
        assert!(batch.is_empty());
        batch.insert(ACTIONS, Array2::zeros((2, 1))).unwrap();
        batch.insert(ACTIONS, Array2::zeros((5, 1))).unwrap();
        assert_eq!(batch.len(), 5);
    }

    #[test]
    fn slices_every_field() {
        let mini = batch().slice(1, 3).unwrap();
        assert_eq!(mini.len(), 2);
        assert_eq!(mini.get(VECTOR_OBS).unwrap(), &array![[2.0_f32, 3.], [4., 5.]]);
        assert_eq!(mini.get(ACTIONS).unwrap(), &array![[1.0_f32], [0.]]);
    }

    #[test]
    fn bad_slices_and_fields() {
        let batch = batch();
        assert!(batch.slice(2, 2).is_err());
        assert!(batch.slice(3, 5).is_err());
        assert!(matches!(
            batch.get("visual_obs0"),
            Err(PolicyErr::MissingBatchField { key }) if key == "visual_obs0"
        ));
    }
}
