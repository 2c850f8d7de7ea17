//! Store addresses: a 64-bit value split into a segment number and an offset within that
//! segment, plus the small family of types built on top of it (extents, typed addresses).

use std::fmt;
use std::marker::PhantomData;

/// Size in bytes of one addressable segment (`S` in the design documents). Fixed at 4 MiB,
/// matching the source project's own segment quantum.
pub const SEGMENT_SIZE: u64 = 4 * 1024 * 1024;

/// `log2(SEGMENT_SIZE)`. `SEGMENT_SIZE` must stay a power of two for this to be meaningful.
pub const SEGMENT_BITS: u32 = SEGMENT_SIZE.trailing_zeros();

const OFFSET_MASK: u64 = SEGMENT_SIZE - 1;

const _: () = assert!(SEGMENT_SIZE.is_power_of_two());

/// A 64-bit store-local address: segment number in the high bits, offset within segment in
/// the low bits. Zero is a valid address (the very first byte of the leader).
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct Address(u64);

impl Address {
    pub const fn null() -> Self {
        Address(0)
    }

    pub const fn new(absolute: u64) -> Self {
        Address(absolute)
    }

    pub const fn absolute(self) -> u64 {
        self.0
    }

    /// The segment number (`addr >> SEGMENT_BITS`).
    pub const fn segment(self) -> u64 {
        self.0 >> SEGMENT_BITS
    }

    /// The offset within the owning segment (`addr & (SEGMENT_SIZE - 1)`).
    pub const fn offset(self) -> u64 {
        self.0 & OFFSET_MASK
    }

    pub const fn is_null(self) -> bool {
        self.0 == 0
    }

    /// Builds an address from a segment number and an in-segment offset.
    ///
    /// # Panics
    /// Panics if `offset >= SEGMENT_SIZE`.
    pub fn from_segment_offset(segment: u64, offset: u64) -> Self {
        assert!(offset < SEGMENT_SIZE, "offset does not fit within a segment");
        Address((segment << SEGMENT_BITS) | offset)
    }

    pub const fn checked_add(self, delta: u64) -> Option<Self> {
        match self.0.checked_add(delta) {
            Some(v) => Some(Address(v)),
            None => None,
        }
    }
}

impl fmt::Debug for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Address({:#x})", self.0)
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#x}", self.0)
    }
}

impl From<u64> for Address {
    fn from(v: u64) -> Self {
        Address(v)
    }
}

impl From<Address> for u64 {
    fn from(a: Address) -> Self {
        a.0
    }
}

/// A byte range within the store: a starting address and a length in bytes.
#[derive(Clone, Copy, PartialEq, Eq, Debug, Default)]
pub struct Extent {
    pub addr: Address,
    pub size: u64,
}

impl Extent {
    pub const fn new(addr: Address, size: u64) -> Self {
        Extent { addr, size }
    }

    pub const fn end(&self) -> Option<Address> {
        match self.addr.checked_add(self.size) {
            Some(a) => Some(a),
            None => None,
        }
    }
}

/// A store address carrying a phantom element type and that type's alignment contract.
///
/// Two `TypedAddress<T>` values with the same underlying [`Address`] are interchangeable; the
/// phantom type exists purely so that callers cannot accidentally read a `TypedAddress<Header>`
/// as though it pointed at a `Trailer`.
pub struct TypedAddress<T> {
    addr: Address,
    _marker: PhantomData<fn() -> T>,
}

impl<T> TypedAddress<T> {
    pub const fn new(addr: Address) -> Self {
        TypedAddress {
            addr,
            _marker: PhantomData,
        }
    }

    pub const fn untyped(self) -> Address {
        self.addr
    }

    /// `true` when `self.addr` satisfies `align_of::<T>()`.
    pub fn is_aligned(&self) -> bool {
        self.addr.absolute() % std::mem::align_of::<T>() as u64 == 0
    }
}

impl<T> Clone for TypedAddress<T> {
    fn clone(&self) -> Self {
        *self
    }
}
impl<T> Copy for TypedAddress<T> {}

impl<T> PartialEq for TypedAddress<T> {
    fn eq(&self, other: &Self) -> bool {
        self.addr == other.addr
    }
}
impl<T> Eq for TypedAddress<T> {}

impl<T> fmt::Debug for TypedAddress<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "TypedAddress({:?})", self.addr)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn segment_and_offset_round_trip() {
        let a = Address::from_segment_offset(3, 17);
        assert_eq!(a.segment(), 3);
        assert_eq!(a.offset(), 17);
    }

    #[test]
    fn absolute_matches_segment_math() {
        let a = Address::new(SEGMENT_SIZE * 5 + 100);
        assert_eq!(a.segment(), 5);
        assert_eq!(a.offset(), 100);
    }

    #[test]
    fn null_address_is_zero() {
        assert!(Address::null().is_null());
        assert_eq!(Address::null().segment(), 0);
        assert_eq!(Address::null().offset(), 0);
    }

    #[test]
    #[should_panic]
    fn from_segment_offset_rejects_overflowing_offset() {
        Address::from_segment_offset(0, SEGMENT_SIZE);
    }

    #[test]
    fn extent_end_computes_exclusive_bound() {
        let e = Extent::new(Address::new(100), 50);
        assert_eq!(e.end().unwrap().absolute(), 150);
    }

    quickcheck::quickcheck! {
        // Every in-range (segment, offset) pair round-trips through `from_segment_offset`,
        // regardless of how large the segment number or how it lands within the segment.
        fn segment_offset_round_trips(segment_raw: u64, offset_raw: u64) -> bool {
            let segment = segment_raw & ((1u64 << (64 - SEGMENT_BITS)) - 1);
            let offset = offset_raw % SEGMENT_SIZE;
            let addr = Address::from_segment_offset(segment, offset);
            addr.segment() == segment && addr.offset() == offset
        }

        // `Address::new`/`absolute` never lose or reinterpret bits, for any 64-bit value.
        fn absolute_round_trips_through_new(value: u64) -> bool {
            Address::new(value).absolute() == value
        }
    }
}
