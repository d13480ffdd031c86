use glam::{Quat, Vec2, Vec3, Vec4};

use super::bitstream::{BitError, BitStream, bits_to_represent};

/// The expected type of a serialized [`Variant`]. The tag itself is never
/// written to the wire; both sides must agree on the kind up front.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VariantKind {
    Bool,
    Int,
    DoubleInt,
    Real,
    Real2,
    Real3,
    Real4,
    Quaternion,
    Enum,
    ResourceId,
    Stream,
}

/// How a variant's floating-point components are packed.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub enum ValueEncoding {
    #[default]
    Full,
    Half,
    Quantized {
        min: f32,
        max: f32,
        quantum: f32,
    },
}

/// A dynamically-typed replicated value.
#[derive(Debug, Clone, PartialEq)]
pub enum Variant {
    Bool(bool),
    Int(i32),
    DoubleInt(i64),
    Real(f32),
    Real2(Vec2),
    Real3(Vec3),
    Real4(Vec4),
    Quaternion(Quat),
    /// An enum value bounded by the cardinality of its bound type.
    Enum { value: u32, count: u32 },
    /// A reference to a resource by its 64-bit id.
    ResourceId(u64),
    Stream(BitStream),
}

impl Variant {
    pub fn kind(&self) -> VariantKind {
        match self {
            Variant::Bool(_) => VariantKind::Bool,
            Variant::Int(_) => VariantKind::Int,
            Variant::DoubleInt(_) => VariantKind::DoubleInt,
            Variant::Real(_) => VariantKind::Real,
            Variant::Real2(_) => VariantKind::Real2,
            Variant::Real3(_) => VariantKind::Real3,
            Variant::Real4(_) => VariantKind::Real4,
            Variant::Quaternion(_) => VariantKind::Quaternion,
            Variant::Enum { .. } => VariantKind::Enum,
            Variant::ResourceId(_) => VariantKind::ResourceId,
            Variant::Stream(_) => VariantKind::Stream,
        }
    }

    fn write_component(stream: &mut BitStream, value: f32, encoding: ValueEncoding) {
        match encoding {
            ValueEncoding::Full => stream.write_f32(value),
            ValueEncoding::Half => stream.write_half(value),
            ValueEncoding::Quantized { min, max, quantum } => {
                // The range was validated at configuration time.
                let _ = stream.write_quantized_f32(value, min, max, quantum);
            }
        }
    }

    fn read_component(stream: &mut BitStream, encoding: ValueEncoding) -> Result<f32, BitError> {
        match encoding {
            ValueEncoding::Full => stream.read_f32(),
            ValueEncoding::Half => stream.read_half(),
            ValueEncoding::Quantized { min, max, quantum } => {
                stream.read_quantized_f32(min, max, quantum)
            }
        }
    }

    /// Serializes the value without its tag.
    pub fn write(&self, stream: &mut BitStream, encoding: ValueEncoding) -> Result<(), BitError> {
        match self {
            Variant::Bool(value) => stream.write_bool(*value),
            Variant::Int(value) => stream.write_i32(*value),
            Variant::DoubleInt(value) => stream.write_i64(*value),
            Variant::Real(value) => Self::write_component(stream, *value, encoding),
            Variant::Real2(value) => {
                Self::write_component(stream, value.x, encoding);
                Self::write_component(stream, value.y, encoding);
            }
            Variant::Real3(value) => {
                Self::write_component(stream, value.x, encoding);
                Self::write_component(stream, value.y, encoding);
                Self::write_component(stream, value.z, encoding);
            }
            Variant::Real4(value) => {
                for component in value.to_array() {
                    Self::write_component(stream, component, encoding);
                }
            }
            Variant::Quaternion(value) => {
                for component in value.to_array() {
                    Self::write_component(stream, component, encoding);
                }
            }
            Variant::Enum { value, count } => {
                let max = count.saturating_sub(1);
                stream.write_uint(u64::from(*value), bits_to_represent(u64::from(max)));
            }
            Variant::ResourceId(value) => stream.write_u64(*value),
            Variant::Stream(value) => stream.write_sized_stream(value)?,
        }
        Ok(())
    }

    /// Deserializes a value of `kind` into `self`, which supplies the expected
    /// type (and, for enums, the cardinality).
    pub fn read_in_place(
        &mut self,
        stream: &mut BitStream,
        encoding: ValueEncoding,
    ) -> Result<(), BitError> {
        match self {
            Variant::Bool(value) => *value = stream.read_bool()?,
            Variant::Int(value) => *value = stream.read_i32()?,
            Variant::DoubleInt(value) => *value = stream.read_i64()?,
            Variant::Real(value) => *value = Self::read_component(stream, encoding)?,
            Variant::Real2(value) => {
                value.x = Self::read_component(stream, encoding)?;
                value.y = Self::read_component(stream, encoding)?;
            }
            Variant::Real3(value) => {
                value.x = Self::read_component(stream, encoding)?;
                value.y = Self::read_component(stream, encoding)?;
                value.z = Self::read_component(stream, encoding)?;
            }
            Variant::Real4(value) => {
                *value = Vec4::new(
                    Self::read_component(stream, encoding)?,
                    Self::read_component(stream, encoding)?,
                    Self::read_component(stream, encoding)?,
                    Self::read_component(stream, encoding)?,
                );
            }
            Variant::Quaternion(value) => {
                *value = Quat::from_xyzw(
                    Self::read_component(stream, encoding)?,
                    Self::read_component(stream, encoding)?,
                    Self::read_component(stream, encoding)?,
                    Self::read_component(stream, encoding)?,
                );
            }
            Variant::Enum { value, count } => {
                let max = count.saturating_sub(1);
                *value = stream.read_uint(bits_to_represent(u64::from(max)))? as u32;
            }
            Variant::ResourceId(value) => *value = stream.read_u64()?,
            Variant::Stream(value) => *value = stream.read_sized_stream()?,
        }
        Ok(())
    }

    /// Largest absolute per-component difference between two values of the
    /// same kind, used for change detection and snap thresholds.
    pub fn distance(&self, other: &Variant) -> f32 {
        match (self, other) {
            (Variant::Bool(a), Variant::Bool(b)) => {
                if a == b { 0.0 } else { 1.0 }
            }
            (Variant::Int(a), Variant::Int(b)) => (*a as f32 - *b as f32).abs(),
            (Variant::DoubleInt(a), Variant::DoubleInt(b)) => (*a as f64 - *b as f64).abs() as f32,
            (Variant::Real(a), Variant::Real(b)) => (a - b).abs(),
            (Variant::Real2(a), Variant::Real2(b)) => (*a - *b).abs().max_element(),
            (Variant::Real3(a), Variant::Real3(b)) => (*a - *b).abs().max_element(),
            (Variant::Real4(a), Variant::Real4(b)) => (*a - *b).abs().max_element(),
            (Variant::Quaternion(a), Variant::Quaternion(b)) => {
                (Vec4::from(a.to_array()) - Vec4::from(b.to_array()))
                    .abs()
                    .max_element()
            }
            (Variant::Enum { value: a, .. }, Variant::Enum { value: b, .. }) => {
                if a == b { 0.0 } else { 1.0 }
            }
            (Variant::ResourceId(a), Variant::ResourceId(b)) => {
                if a == b { 0.0 } else { 1.0 }
            }
            (Variant::Stream(a), Variant::Stream(b)) => {
                if a == b { 0.0 } else { 1.0 }
            }
            _ => f32::INFINITY,
        }
    }

    /// Linear interpolation between two values of the same kind. Discrete
    /// kinds step at the halfway point; quaternions use shortest-arc slerp.
    pub fn lerp(&self, other: &Variant, t: f32) -> Variant {
        match (self, other) {
            (Variant::Real(a), Variant::Real(b)) => Variant::Real(a + (b - a) * t),
            (Variant::Real2(a), Variant::Real2(b)) => Variant::Real2(a.lerp(*b, t)),
            (Variant::Real3(a), Variant::Real3(b)) => Variant::Real3(a.lerp(*b, t)),
            (Variant::Real4(a), Variant::Real4(b)) => Variant::Real4(a.lerp(*b, t)),
            (Variant::Quaternion(a), Variant::Quaternion(b)) => {
                let b = if a.dot(*b) < 0.0 { -*b } else { *b };
                Variant::Quaternion(a.slerp(b, t).normalize())
            }
            _ => {
                if t < 0.5 {
                    self.clone()
                } else {
                    other.clone()
                }
            }
        }
    }

    /// Catmull-Rom interpolation through `p1..p2` for continuous kinds; falls
    /// back to [`lerp`](Self::lerp) otherwise.
    pub fn hermite(p0: &Variant, p1: &Variant, p2: &Variant, p3: &Variant, t: f32) -> Variant {
        fn coefficients(t: f32) -> [f32; 4] {
            let t2 = t * t;
            let t3 = t2 * t;
            [
                -0.5 * t3 + t2 - 0.5 * t,
                1.5 * t3 - 2.5 * t2 + 1.0,
                -1.5 * t3 + 2.0 * t2 + 0.5 * t,
                0.5 * t3 - 0.5 * t2,
            ]
        }

        match (p0, p1, p2, p3) {
            (Variant::Real(a), Variant::Real(b), Variant::Real(c), Variant::Real(d)) => {
                let [c0, c1, c2, c3] = coefficients(t);
                Variant::Real(a * c0 + b * c1 + c * c2 + d * c3)
            }
            (Variant::Real2(a), Variant::Real2(b), Variant::Real2(c), Variant::Real2(d)) => {
                let [c0, c1, c2, c3] = coefficients(t);
                Variant::Real2(*a * c0 + *b * c1 + *c * c2 + *d * c3)
            }
            (Variant::Real3(a), Variant::Real3(b), Variant::Real3(c), Variant::Real3(d)) => {
                let [c0, c1, c2, c3] = coefficients(t);
                Variant::Real3(*a * c0 + *b * c1 + *c * c2 + *d * c3)
            }
            (Variant::Real4(a), Variant::Real4(b), Variant::Real4(c), Variant::Real4(d)) => {
                let [c0, c1, c2, c3] = coefficients(t);
                Variant::Real4(*a * c0 + *b * c1 + *c * c2 + *d * c3)
            }
            _ => p1.lerp(p2, t),
        }
    }

    pub fn is_floating_point(&self) -> bool {
        matches!(
            self,
            Variant::Real(_)
                | Variant::Real2(_)
                | Variant::Real3(_)
                | Variant::Real4(_)
                | Variant::Quaternion(_)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn round_trip(value: Variant, encoding: ValueEncoding) -> Variant {
        let mut stream = BitStream::new();
        value.write(&mut stream, encoding).unwrap();
        let mut decoded = value.clone();
        decoded.read_in_place(&mut stream, encoding).unwrap();
        assert_eq!(stream.bits_remaining(), 0);
        decoded
    }

    #[test]
    fn type_fidelity() {
        let values = [
            Variant::Bool(true),
            Variant::Int(-1234),
            Variant::DoubleInt(1 << 40),
            Variant::Real(9.75),
            Variant::Real3(Vec3::new(1.0, 2.0, 3.0)),
            Variant::Quaternion(Quat::IDENTITY),
            Variant::Enum { value: 5, count: 12 },
            Variant::ResourceId(0xfeed_beef_dead_c0de),
        ];
        for value in values {
            assert_eq!(round_trip(value.clone(), ValueEncoding::Full), value);
        }
    }

    #[test]
    fn enum_uses_cardinality_bits() {
        let mut stream = BitStream::new();
        Variant::Enum { value: 3, count: 12 }
            .write(&mut stream, ValueEncoding::Full)
            .unwrap();
        // 12 values need 4 bits.
        assert_eq!(stream.bits_written(), 4);
    }

    #[test]
    fn quantized_vector() {
        let encoding = ValueEncoding::Quantized {
            min: -10.0,
            max: 10.0,
            quantum: 0.01,
        };
        let value = Variant::Real3(Vec3::new(1.0, -2.345, 9.99));
        let decoded = round_trip(value.clone(), encoding);
        assert!(value.distance(&decoded) <= 0.005 + 1e-5);
    }

    #[test]
    fn nested_stream_round_trip() {
        let mut inner = BitStream::new();
        inner.write_u16(777);
        let value = Variant::Stream(inner);
        let decoded = round_trip(value, ValueEncoding::Full);
        match decoded {
            Variant::Stream(mut stream) => assert_eq!(stream.read_u16().unwrap(), 777),
            other => panic!("unexpected variant {other:?}"),
        }
    }

    #[test]
    fn lerp_midpoint() {
        let a = Variant::Real3(Vec3::ZERO);
        let b = Variant::Real3(Vec3::new(2.0, 4.0, 6.0));
        assert_eq!(a.lerp(&b, 0.5), Variant::Real3(Vec3::new(1.0, 2.0, 3.0)));
    }

    #[test]
    fn distance_is_max_component() {
        let a = Variant::Real3(Vec3::new(0.0, 0.0, 0.0));
        let b = Variant::Real3(Vec3::new(0.1, -0.7, 0.3));
        assert!((a.distance(&b) - 0.7).abs() < 1e-6);
    }
}
