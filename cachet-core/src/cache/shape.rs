//! Top-level shape detection for serializable values
//!
//! A throwaway [`Serializer`] that records which serde data-model kind a value
//! starts with, without serializing its children. The only thing counted is the
//! number of fields a struct actually emits.

use serde::ser::{self, Serialize, Serializer};
use std::fmt;

/// What a value looks like at the top level
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValueShape {
    /// `None` or `()`
    Null,
    /// Numbers, strings, booleans, chars, bytes, unit structs and enum variants
    Primitive,
    /// Sequences, tuples and maps
    Collection,
    /// A struct, with the number of fields it serialized
    Composite { fields: usize },
}

impl ValueShape {
    pub fn is_composite(&self) -> bool {
        matches!(self, Self::Composite { .. })
    }
}

/// Error raised by a value's own `Serialize` impl during probing
#[derive(Debug)]
pub struct ProbeError(String);

impl fmt::Display for ProbeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "shape probe failed: {}", self.0)
    }
}

impl std::error::Error for ProbeError {}

impl ser::Error for ProbeError {
    fn custom<T: fmt::Display>(msg: T) -> Self {
        ProbeError(msg.to_string())
    }
}

/// Detect the top-level shape of `value`
pub fn probe<T: Serialize + ?Sized>(value: &T) -> Result<ValueShape, ProbeError> {
    value.serialize(ShapeProbe)
}

struct ShapeProbe;

/// Collects nothing; counts struct fields
struct Compound {
    shape: ValueShape,
}

impl Compound {
    fn new(shape: ValueShape) -> Self {
        Self { shape }
    }
}

impl Serializer for ShapeProbe {
    type Ok = ValueShape;
    type Error = ProbeError;
    type SerializeSeq = Compound;
    type SerializeTuple = Compound;
    type SerializeTupleStruct = Compound;
    type SerializeTupleVariant = Compound;
    type SerializeMap = Compound;
    type SerializeStruct = Compound;
    type SerializeStructVariant = Compound;

    fn serialize_bool(self, _v: bool) -> Result<ValueShape, ProbeError> {
        Ok(ValueShape::Primitive)
    }

    fn serialize_i8(self, _v: i8) -> Result<ValueShape, ProbeError> {
        Ok(ValueShape::Primitive)
    }

    fn serialize_i16(self, _v: i16) -> Result<ValueShape, ProbeError> {
        Ok(ValueShape::Primitive)
    }

    fn serialize_i32(self, _v: i32) -> Result<ValueShape, ProbeError> {
        Ok(ValueShape::Primitive)
    }

    fn serialize_i64(self, _v: i64) -> Result<ValueShape, ProbeError> {
        Ok(ValueShape::Primitive)
    }

    fn serialize_i128(self, _v: i128) -> Result<ValueShape, ProbeError> {
        Ok(ValueShape::Primitive)
    }

    fn serialize_u8(self, _v: u8) -> Result<ValueShape, ProbeError> {
        Ok(ValueShape::Primitive)
    }

    fn serialize_u16(self, _v: u16) -> Result<ValueShape, ProbeError> {
        Ok(ValueShape::Primitive)
    }

    fn serialize_u32(self, _v: u32) -> Result<ValueShape, ProbeError> {
        Ok(ValueShape::Primitive)
    }

    fn serialize_u64(self, _v: u64) -> Result<ValueShape, ProbeError> {
        Ok(ValueShape::Primitive)
    }

    fn serialize_u128(self, _v: u128) -> Result<ValueShape, ProbeError> {
        Ok(ValueShape::Primitive)
    }

    fn serialize_f32(self, _v: f32) -> Result<ValueShape, ProbeError> {
        Ok(ValueShape::Primitive)
    }

    fn serialize_f64(self, _v: f64) -> Result<ValueShape, ProbeError> {
        Ok(ValueShape::Primitive)
    }

    fn serialize_char(self, _v: char) -> Result<ValueShape, ProbeError> {
        Ok(ValueShape::Primitive)
    }

    fn serialize_str(self, _v: &str) -> Result<ValueShape, ProbeError> {
        Ok(ValueShape::Primitive)
    }

    fn serialize_bytes(self, _v: &[u8]) -> Result<ValueShape, ProbeError> {
        Ok(ValueShape::Primitive)
    }

    fn serialize_none(self) -> Result<ValueShape, ProbeError> {
        Ok(ValueShape::Null)
    }

    fn serialize_some<T: Serialize + ?Sized>(self, value: &T) -> Result<ValueShape, ProbeError> {
        value.serialize(self)
    }

    fn serialize_unit(self) -> Result<ValueShape, ProbeError> {
        Ok(ValueShape::Null)
    }

    fn serialize_unit_struct(self, _name: &'static str) -> Result<ValueShape, ProbeError> {
        Ok(ValueShape::Primitive)
    }

    fn serialize_unit_variant(
        self,
        _name: &'static str,
        _variant_index: u32,
        _variant: &'static str,
    ) -> Result<ValueShape, ProbeError> {
        Ok(ValueShape::Primitive)
    }

    fn serialize_newtype_struct<T: Serialize + ?Sized>(
        self,
        _name: &'static str,
        value: &T,
    ) -> Result<ValueShape, ProbeError> {
        value.serialize(self)
    }

    fn serialize_newtype_variant<T: Serialize + ?Sized>(
        self,
        _name: &'static str,
        _variant_index: u32,
        _variant: &'static str,
        _value: &T,
    ) -> Result<ValueShape, ProbeError> {
        Ok(ValueShape::Primitive)
    }

    fn serialize_seq(self, _len: Option<usize>) -> Result<Compound, ProbeError> {
        Ok(Compound::new(ValueShape::Collection))
    }

    fn serialize_tuple(self, _len: usize) -> Result<Compound, ProbeError> {
        Ok(Compound::new(ValueShape::Collection))
    }

    fn serialize_tuple_struct(
        self,
        _name: &'static str,
        _len: usize,
    ) -> Result<Compound, ProbeError> {
        Ok(Compound::new(ValueShape::Collection))
    }

    fn serialize_tuple_variant(
        self,
        _name: &'static str,
        _variant_index: u32,
        _variant: &'static str,
        _len: usize,
    ) -> Result<Compound, ProbeError> {
        Ok(Compound::new(ValueShape::Primitive))
    }

    fn serialize_map(self, _len: Option<usize>) -> Result<Compound, ProbeError> {
        Ok(Compound::new(ValueShape::Collection))
    }

    fn serialize_struct(self, _name: &'static str, _len: usize) -> Result<Compound, ProbeError> {
        Ok(Compound::new(ValueShape::Composite { fields: 0 }))
    }

    fn serialize_struct_variant(
        self,
        _name: &'static str,
        _variant_index: u32,
        _variant: &'static str,
        _len: usize,
    ) -> Result<Compound, ProbeError> {
        Ok(Compound::new(ValueShape::Primitive))
    }
}

impl ser::SerializeSeq for Compound {
    type Ok = ValueShape;
    type Error = ProbeError;

    fn serialize_element<T: Serialize + ?Sized>(&mut self, _value: &T) -> Result<(), ProbeError> {
        Ok(())
    }

    fn end(self) -> Result<ValueShape, ProbeError> {
        Ok(self.shape)
    }
}

impl ser::SerializeTuple for Compound {
    type Ok = ValueShape;
    type Error = ProbeError;

    fn serialize_element<T: Serialize + ?Sized>(&mut self, _value: &T) -> Result<(), ProbeError> {
        Ok(())
    }

    fn end(self) -> Result<ValueShape, ProbeError> {
        Ok(self.shape)
    }
}

impl ser::SerializeTupleStruct for Compound {
    type Ok = ValueShape;
    type Error = ProbeError;

    fn serialize_field<T: Serialize + ?Sized>(&mut self, _value: &T) -> Result<(), ProbeError> {
        Ok(())
    }

    fn end(self) -> Result<ValueShape, ProbeError> {
        Ok(self.shape)
    }
}

impl ser::SerializeTupleVariant for Compound {
    type Ok = ValueShape;
    type Error = ProbeError;

    fn serialize_field<T: Serialize + ?Sized>(&mut self, _value: &T) -> Result<(), ProbeError> {
        Ok(())
    }

    fn end(self) -> Result<ValueShape, ProbeError> {
        Ok(self.shape)
    }
}

impl ser::SerializeMap for Compound {
    type Ok = ValueShape;
    type Error = ProbeError;

    fn serialize_key<T: Serialize + ?Sized>(&mut self, _key: &T) -> Result<(), ProbeError> {
        Ok(())
    }

    fn serialize_value<T: Serialize + ?Sized>(&mut self, _value: &T) -> Result<(), ProbeError> {
        Ok(())
    }

    fn end(self) -> Result<ValueShape, ProbeError> {
        Ok(self.shape)
    }
}

impl ser::SerializeStruct for Compound {
    type Ok = ValueShape;
    type Error = ProbeError;

    fn serialize_field<T: Serialize + ?Sized>(
        &mut self,
        _key: &'static str,
        _value: &T,
    ) -> Result<(), ProbeError> {
        if let ValueShape::Composite { fields } = &mut self.shape {
            *fields += 1;
        }
        Ok(())
    }

    fn end(self) -> Result<ValueShape, ProbeError> {
        Ok(self.shape)
    }
}

impl ser::SerializeStructVariant for Compound {
    type Ok = ValueShape;
    type Error = ProbeError;

    fn serialize_field<T: Serialize + ?Sized>(
        &mut self,
        _key: &'static str,
        _value: &T,
    ) -> Result<(), ProbeError> {
        Ok(())
    }

    fn end(self) -> Result<ValueShape, ProbeError> {
        Ok(self.shape)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Serialize;
    use std::collections::HashMap;

    #[derive(Serialize)]
    struct Order {
        id: u64,
        total: f64,
        status: String,
    }

    #[derive(Serialize)]
    struct Sparse {
        a: u32,
        #[serde(skip_serializing_if = "Option::is_none")]
        b: Option<u32>,
    }

    #[derive(Serialize)]
    struct Wrapper(Order);

    #[derive(Serialize)]
    enum Status {
        Paid,
        Refunded { amount: f64 },
    }

    #[test]
    fn test_primitives() {
        assert_eq!(probe(&42u32).unwrap(), ValueShape::Primitive);
        assert_eq!(probe("text").unwrap(), ValueShape::Primitive);
        assert_eq!(probe(&true).unwrap(), ValueShape::Primitive);
        assert_eq!(probe(&Status::Paid).unwrap(), ValueShape::Primitive);
        assert_eq!(
            probe(&Status::Refunded { amount: 1.0 }).unwrap(),
            ValueShape::Primitive
        );
        assert_eq!(
            probe(&chrono::Utc::now()).unwrap(),
            ValueShape::Primitive
        );
    }

    #[test]
    fn test_null() {
        assert_eq!(probe(&Option::<u32>::None).unwrap(), ValueShape::Null);
        assert_eq!(probe(&()).unwrap(), ValueShape::Null);
    }

    #[test]
    fn test_collections() {
        assert_eq!(probe(&vec![1, 2, 3]).unwrap(), ValueShape::Collection);
        assert_eq!(probe(&(1, "a")).unwrap(), ValueShape::Collection);
        let map: HashMap<String, u32> = HashMap::new();
        assert_eq!(probe(&map).unwrap(), ValueShape::Collection);
    }

    #[test]
    fn test_struct_field_count() {
        let order = Order {
            id: 42,
            total: 9.99,
            status: "PAID".to_string(),
        };
        assert_eq!(probe(&order).unwrap(), ValueShape::Composite { fields: 3 });
        assert_eq!(
            probe(&Some(Wrapper(order))).unwrap(),
            ValueShape::Composite { fields: 3 }
        );
    }

    #[test]
    fn test_skipped_fields_not_counted() {
        let sparse = Sparse { a: 1, b: None };
        assert_eq!(probe(&sparse).unwrap(), ValueShape::Composite { fields: 1 });
    }
}
