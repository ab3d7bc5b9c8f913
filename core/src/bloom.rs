use bloomfilter::Bloom;
use serde::de::{self, MapAccess, Visitor};
use serde::ser::SerializeMap;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;

/// A probabilistic set with a tunable false-positive rate.
///
/// Wraps [`bloomfilter::Bloom`], which already gives us no false negatives,
/// a bounded false-positive rate, and (critically for convergence, spec
/// §4.1/§9) randomly chosen hash seeds per instance rather than seeds
/// derived from `size`/`fpr`. We add the declared `size`/`fpr` metadata
/// the wire format needs, since the underlying crate only stores the
/// derived bit-length and hash count.
pub struct BloomFilter {
    inner: Bloom<str>,
    size: usize,
    fpr: f64,
}

impl BloomFilter {
    /// Builds an empty filter sized for `size` items at false-positive
    /// rate `fpr`. `fpr` is clamped into `(0, 0.5]` per the data model
    /// invariant.
    pub fn new(size: usize, fpr: f64) -> Self {
        let fpr = fpr.clamp(f64::MIN_POSITIVE, 0.5);
        let size = size.max(1);
        Self {
            inner: Bloom::new_for_fp_rate(size, fpr),
            size,
            fpr,
        }
    }

    /// Adds an ID. `has` is guaranteed `true` for it from this point on.
    pub fn add(&mut self, id: &str) {
        self.inner.set(id);
    }

    /// Returns `true` for every added ID; may return `true` for a never
    /// added ID with probability at most the filter's declared `fpr`.
    pub fn has(&self, id: &str) -> bool {
        self.inner.check(id)
    }

    /// The cardinality hint this filter was sized for.
    pub fn size(&self) -> usize {
        self.size
    }

    /// The target false-positive rate this filter was built for.
    pub fn fpr(&self) -> f64 {
        self.fpr
    }

    fn from_parts(
        bitmap: Vec<u8>,
        bitmap_bits: u64,
        k_num: u32,
        sip_keys: [(u64, u64); 2],
        size: usize,
        fpr: f64,
    ) -> Self {
        Self {
            inner: Bloom::from_existing(&bitmap, bitmap_bits, k_num, sip_keys),
            size,
            fpr,
        }
    }
}

impl fmt::Debug for BloomFilter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BloomFilter")
            .field("size", &self.size)
            .field("fpr", &self.fpr)
            .field("bits", &self.inner.number_of_bits())
            .field("hashes", &self.inner.number_of_hash_functions())
            .finish()
    }
}

impl Clone for BloomFilter {
    fn clone(&self) -> Self {
        Self::from_parts(
            self.inner.bitmap(),
            self.inner.number_of_bits(),
            self.inner.number_of_hash_functions(),
            self.inner.sip_keys(),
            self.size,
            self.fpr,
        )
    }
}

/// Field names of the nested filter object inside a sync message (spec §4.3/§6).
mod keys {
    pub const SIZE: &str = "size";
    pub const FPR: &str = "fpr";
    pub const BITS: &str = "bits";
    pub const K: &str = "k";
    pub const SEEDS: &str = "seeds";
    pub const BITMAP: &str = "bitmap";
}

impl Serialize for BloomFilter {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        let sip_keys = self.inner.sip_keys();
        let seeds = [sip_keys[0].0, sip_keys[0].1, sip_keys[1].0, sip_keys[1].1];
        let mut map = serializer.serialize_map(Some(6))?;
        map.serialize_entry(keys::SIZE, &self.size)?;
        map.serialize_entry(keys::FPR, &self.fpr)?;
        map.serialize_entry(keys::BITS, &self.inner.number_of_bits())?;
        map.serialize_entry(keys::K, &self.inner.number_of_hash_functions())?;
        map.serialize_entry(keys::SEEDS, &seeds)?;
        map.serialize_entry(keys::BITMAP, &self.inner.bitmap())?;
        map.end()
    }
}

impl<'de> Deserialize<'de> for BloomFilter {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        struct FilterVisitor;

        impl<'de> Visitor<'de> for FilterVisitor {
            type Value = BloomFilter;

            fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str("a serialized bloom filter")
            }

            fn visit_map<A>(self, mut map: A) -> Result<Self::Value, A::Error>
            where
                A: MapAccess<'de>,
            {
                let mut size: Option<usize> = None;
                let mut fpr: Option<f64> = None;
                let mut bits: Option<u64> = None;
                let mut k: Option<u32> = None;
                let mut seeds: Option<[u64; 4]> = None;
                let mut bitmap: Option<Vec<u8>> = None;
                while let Some(key) = map.next_key::<String>()? {
                    match key.as_str() {
                        keys::SIZE => size = Some(map.next_value()?),
                        keys::FPR => fpr = Some(map.next_value()?),
                        keys::BITS => bits = Some(map.next_value()?),
                        keys::K => k = Some(map.next_value()?),
                        keys::SEEDS => seeds = Some(map.next_value()?),
                        keys::BITMAP => bitmap = Some(map.next_value()?),
                        _ => {
                            let _ignored: de::IgnoredAny = map.next_value()?;
                        }
                    }
                }
                let seeds = seeds.ok_or_else(|| de::Error::missing_field(keys::SEEDS))?;
                let sip_keys = [(seeds[0], seeds[1]), (seeds[2], seeds[3])];
                Ok(BloomFilter::from_parts(
                    bitmap.ok_or_else(|| de::Error::missing_field(keys::BITMAP))?,
                    bits.ok_or_else(|| de::Error::missing_field(keys::BITS))?,
                    k.ok_or_else(|| de::Error::missing_field(keys::K))?,
                    sip_keys,
                    size.unwrap_or(1),
                    fpr.unwrap_or(0.5),
                ))
            }
        }

        deserializer.deserialize_map(FilterVisitor)
    }
}
