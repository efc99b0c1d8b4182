//! The tagged-less stack cell: a `Cell(u64)` newtype with typed accessor
//! methods rather than a C-style union or an inheritance hierarchy. The VM
//! itself never inspects which accessor produced a given cell; only the
//! instruction that reads it knows.

#[derive(Clone, Copy, Default, PartialEq, Eq)]
pub struct Cell(pub u64);

impl std::fmt::Debug for Cell {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Cell(0x{:016x})", self.0)
    }
}

macro_rules! int_accessors {
    ($from:ident, $as_signed:ident, $as_unsigned:ident, $signed:ty, $unsigned:ty) => {
        pub fn $from(v: $signed) -> Cell {
            Cell(v as $unsigned as u64)
        }

        pub fn $as_signed(self) -> $signed {
            self.0 as $unsigned as $signed
        }

        pub fn $as_unsigned(self) -> $unsigned {
            self.0 as $unsigned
        }
    };
}

impl Cell {
    int_accessors!(from_i32, as_i32, as_u32, i32, u32);
    int_accessors!(from_i64, as_i64, as_u64, i64, u64);

    pub fn from_f32(v: f32) -> Cell {
        Cell(v.to_bits() as u64)
    }

    pub fn as_f32(self) -> f32 {
        f32::from_bits(self.0 as u32)
    }

    pub fn from_f64(v: f64) -> Cell {
        Cell(v.to_bits())
    }

    pub fn as_f64(self) -> f64 {
        f64::from_bits(self.0)
    }

    pub fn from_index(v: usize) -> Cell {
        Cell(v as u64)
    }

    pub fn as_index(self) -> usize {
        self.0 as usize
    }

    pub fn from_bool(v: bool) -> Cell {
        Cell(v as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn i32_round_trips_through_the_unsigned_lane() {
        assert_eq!(Cell::from_i32(-1).as_i32(), -1);
        assert_eq!(Cell::from_i32(-1).as_u32(), u32::MAX);
    }

    #[test]
    fn float_bits_are_reinterpreted_not_converted() {
        let one = Cell::from_f32(1.0);
        assert_eq!(one.0, 0x3F800000);
        assert_eq!(Cell(0x3F800000).as_i32(), 0x3F800000);
    }
}
