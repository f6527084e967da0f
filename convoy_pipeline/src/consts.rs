use bytesize::ByteSize;

/// Hard cap of a single block, except for an oversized first event.
pub const BLOCK_MAX_BYTESIZE: ByteSize = ByteSize::mib(4);

/// Maximum number of blocks in one blob.
pub const BLOB_MAX_BLOCKS: usize = 50_000;

/// Block numbers wrap around at this value.
pub const BLOCK_NUMBER_MODULO: u64 = 1_000_000;

/// First block id of every blob. Ids are zero padded by construction.
pub const BLOCK_ID_BASE: usize = 100_001;

/// Containers younger than retention plus this many days are never cleaned.
pub const CLEANUP_GRACE_DAYS: i64 = 1;

pub const STATE_TABLE_SUFFIX: &str = "BlobsState";
pub const ORPHAN_CONTAINER_SUFFIX: &str = "orphan-blobs";
pub const TEST_CONTAINER_SUFFIX: &str = "test-container";

/// Version of the persisted blob context layout.
pub const BLOB_CONTEXT_VERSION: u32 = 1;
