/// Round up `n` to the nearest `to`
pub const fn round_up(n: usize, to: usize) -> usize {
    to * ((n + to - 1) / to)
}

/// Is `align` acceptable to `posix_memalign()`? That is: a non-zero power of
/// two that is also a multiple of `sizeof(void *)`.
pub const fn is_valid_alignment(align: usize) -> bool {
    align != 0 && align.is_power_of_two() && align % std::mem::size_of::<*const ()>() == 0
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    pub fn round_up_computes_correctly() {
        assert_eq!(round_up(0, 16), 0);
        assert_eq!(round_up(1, 16), 16);
        assert_eq!(round_up(16, 16), 16);
        assert_eq!(round_up(4097, 4096), 8192);
    }

    #[test]
    pub fn only_pointer_multiple_powers_of_two_are_valid_alignments() {
        assert!(is_valid_alignment(8));
        assert!(is_valid_alignment(64));
        assert!(is_valid_alignment(4096));
        assert!(!is_valid_alignment(0));
        assert!(!is_valid_alignment(4));
        assert!(!is_valid_alignment(24));
        assert!(!is_valid_alignment(1));
    }
}
