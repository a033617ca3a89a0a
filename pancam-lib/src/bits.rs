/// Extract an unsigned big-endian value of `width` bits starting `offset` bits
/// into `buf`, counting from the most significant bit of `buf[0]`.
///
/// Callers are responsible for making sure `offset + width` bits are available
/// and that `width <= 64`.
pub(crate) fn extract(buf: &[u8], offset: usize, width: usize) -> u64 {
    debug_assert!(width <= 64, "width {width} too large");
    debug_assert!(offset + width <= buf.len() * 8, "bit range out of bounds");

    let mut value = 0u64;
    let mut bit = offset;
    let end = offset + width;
    while bit < end {
        let byte = buf[bit / 8];
        let shift = 7 - (bit % 8);
        // take the remainder of this byte in one go when it's byte aligned
        if shift == 7 && end - bit >= 8 {
            value = (value << 8) | u64::from(byte);
            bit += 8;
            continue;
        }
        value = (value << 1) | u64::from((byte >> shift) & 0x1);
        bit += 1;
    }
    value
}
