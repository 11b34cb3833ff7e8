//! Deadframes: the outcome of one execution.

use std::sync::Arc;

use rjit_ir::{FailDescr, GcRef, Type, Value};

use crate::frame::JitFrame;

/// Which guard or `FINISH` ended an execution, with the typed values it saved.
///
/// Produced by `execute_token` when a `FINISH` runs or a guard without a
/// bridge fails, and by `force` for a call in flight. Accessors panic on an
/// out-of-range index or a type that differs from what the trace declared.
#[derive(Debug, Clone)]
pub struct Deadframe {
    descr: Arc<FailDescr>,
    types: Vec<Type>,
    values: Vec<u64>,
    frame: Arc<JitFrame>,
}

impl Deadframe {
    pub(crate) fn new(
        descr: Arc<FailDescr>,
        types: Vec<Type>,
        values: Vec<u64>,
        frame: Arc<JitFrame>,
    ) -> Self {
        debug_assert_eq!(types.len(), values.len());
        Self {
            descr,
            types,
            values,
            frame,
        }
    }

    /// The guard or finish descriptor that produced this frame
    pub fn descr(&self) -> &Arc<FailDescr> {
        &self.descr
    }

    /// Number of saved values
    pub fn len(&self) -> usize {
        self.values.len()
    }

    /// Whether no values were saved (a void `FINISH`)
    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// Declared types of the saved values
    pub fn types(&self) -> &[Type] {
        &self.types
    }

    fn raw(&self, index: usize, expected: Type) -> u64 {
        assert!(
            index < self.values.len(),
            "deadframe index {index} out of range ({} values)",
            self.values.len()
        );
        assert_eq!(
            self.types[index], expected,
            "deadframe value {index} is not of type {expected}"
        );
        self.values[index]
    }

    /// Integer at `index`
    pub fn get_int_value(&self, index: usize) -> i64 {
        self.raw(index, Type::Int) as i64
    }

    /// Float at `index`, bit-exact
    pub fn get_float_value(&self, index: usize) -> f64 {
        f64::from_bits(self.raw(index, Type::Float))
    }

    /// Reference at `index`
    pub fn get_ref_value(&self, index: usize) -> GcRef {
        GcRef(self.raw(index, Type::Ref) as usize)
    }

    pub(crate) fn raw_value(&self, index: usize) -> u64 {
        self.values[index]
    }

    /// Value at `index`, whatever its type
    pub fn value(&self, index: usize) -> Value {
        Value::from_bits(self.types[index], self.values[index])
    }

    /// The exception that was pending when the frame was produced, or null
    pub fn exc_value(&self) -> GcRef {
        self.frame.guard_exc().1
    }

    /// Class of the pending exception, 0 when none
    pub fn exc_class(&self) -> usize {
        self.frame.guard_exc().0
    }

    /// Interpreter data attached after a force; shared by every deadframe of the execution
    pub fn savedata_ref(&self) -> GcRef {
        self.frame.savedata()
    }

    /// Attach interpreter data to the execution
    pub fn set_savedata_ref(&self, value: GcRef) {
        self.frame.set_savedata(value);
    }

    /// Whether the execution was forced
    pub fn was_forced(&self) -> bool {
        self.frame.is_forced()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn frame_with(types: Vec<Type>, values: Vec<u64>) -> Deadframe {
        Deadframe::new(FailDescr::final_descr(0), types, values, JitFrame::new(1))
    }

    #[test]
    fn typed_access() {
        let df = frame_with(
            vec![Type::Int, Type::Float, Type::Ref],
            vec![(-3i64) as u64, 2.5f64.to_bits(), 0x1000],
        );
        assert_eq!(df.get_int_value(0), -3);
        assert_eq!(df.get_float_value(1), 2.5);
        assert_eq!(df.get_ref_value(2), GcRef(0x1000));
        assert_eq!(df.value(0), Value::Int(-3));
    }

    #[test]
    #[should_panic(expected = "not of type")]
    fn wrong_type_panics() {
        frame_with(vec![Type::Int], vec![1]).get_float_value(0);
    }

    #[test]
    #[should_panic(expected = "out of range")]
    fn out_of_range_panics() {
        frame_with(vec![], vec![]).get_int_value(0);
    }

    #[test]
    fn savedata_is_shared() {
        let df = frame_with(vec![], vec![]);
        let copy = df.clone();
        df.set_savedata_ref(GcRef(0x40));
        assert_eq!(copy.savedata_ref(), GcRef(0x40));
        assert!(df.exc_value().is_null());
    }
}
