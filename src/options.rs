/// Compression applied to the chunk header, the value buckets and the
/// transition stream.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum Compression {
    None,
    /// Zstandard with the given compression level.
    Zstd(i32),
}

impl Compression {
    /// The byte identifying this compression on the wire.
    pub fn type_byte(self) -> u8 {
        match self {
            Compression::None => 0,
            Compression::Zstd(_) => b'z',
        }
    }
}

/// Options for [`TransposeEncoder`](crate::TransposeEncoder).
#[derive(Clone)]
pub struct EncoderOptions {
    pub compression: Compression,
    /// Approximate uncompressed size of one compression bucket. Smaller
    /// buckets worsen compression density but let a reader decompress fewer
    /// bytes per column. Ignored when compression is [`Compression::None`].
    pub bucket_size: u64,
}

impl Default for EncoderOptions {
    fn default() -> Self {
        Self {
            compression: Compression::Zstd(3),
            bucket_size: 64 << 10,
        }
    }
}

impl EncoderOptions {
    pub fn default_for_test() -> Self {
        Self::default()
    }
}
