/// `ceil(log2(n))`
pub fn log2ceil(n: u64) -> u32 {
    if n <= 1 {
        1
    } else {
        let bitlen = u64::BITS - n.leading_zeros();
        // 1001 = 9 -> 4
        // 1000 = 8 -> 3
        if 1 << (bitlen - 1) == n {
            bitlen - 1
        } else {
            bitlen
        }
    }
}

/// Test if `addr` is a multiple of `align`. An `align` of zero never matches.
pub fn aligned_to(addr: u64, align: u64) -> bool {
    align != 0 && addr % align == 0
}

/// `[start, start + len)` with overflow treated as an empty span.
pub fn span(start: u64, len: u64) -> std::ops::Range<u64> {
    start..start.checked_add(len).unwrap_or(start)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    pub fn log2ceil_computes_correctly() {
        assert_eq!(log2ceil(9), 4);
        assert_eq!(log2ceil(15), 4);
        assert_eq!(log2ceil(8), 3);
        assert_eq!(log2ceil(0), 1);
        assert_eq!(log2ceil(1), 1);
        assert_eq!(log2ceil(2), 1);
        assert_eq!(log2ceil(0xfc080 + 0x20 + 0x3f08), 20);
    }

    #[test]
    fn alignment() {
        assert!(aligned_to(0x1050, 0x10));
        assert!(!aligned_to(0x1058, 0x10));
        assert!(!aligned_to(0x1000, 0));
    }

    #[test]
    fn span_saturates_on_overflow() {
        assert_eq!(span(0x1000, 0x10), 0x1000..0x1010);
        assert!(span(u64::MAX - 1, 0x10).is_empty());
    }
}
