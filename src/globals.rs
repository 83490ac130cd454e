/// Log2 of the fixed segment size. Every piece of heap storage is a region
/// of exactly this size, aligned to its own size, so the segment owning any
/// interior pointer is recoverable by masking the low bits.
pub const LOG_SEGMENT_SIZE: usize = 22;
pub const SEGMENT_SIZE: usize = 1 << LOG_SEGMENT_SIZE; // 4 MiB

/// All cell addresses and cell sizes are multiples of this.
pub const LOG_HEAP_ALIGN: usize = 3;
pub const HEAP_ALIGN: usize = 1 << LOG_HEAP_ALIGN;

/// Granularity of the remembered set: one status byte and one boundary byte
/// per this many bytes of heap.
pub const LOG_CARD_SIZE: usize = 9;
pub const CARD_SIZE: usize = 1 << LOG_CARD_SIZE; // 512
pub const CARDS_PER_SEGMENT: usize = SEGMENT_SIZE >> LOG_CARD_SIZE;

/// One mark bit per heap-aligned address in a segment, packed into words.
pub const MARK_BITS_PER_SEGMENT: usize = SEGMENT_SIZE >> LOG_HEAP_ALIGN;
pub const MARK_BIT_WORDS: usize = MARK_BITS_PER_SEGMENT / 64;

pub const PAGE_SIZE: usize = 4096;

/// Size of the protected strip between a segment's metadata tables and its
/// allocation region. A stray write off the end of the tables faults instead
/// of corrupting cells.
pub const GUARD_SIZE: usize = PAGE_SIZE;

/// Cap on each of the transitive-closure mark stacks. Overflow flips a flag
/// and the mark phase rescans the heap; see `complete_mark`.
pub const MARK_STACK_LIMIT: usize = 128 * 1024;

/// The young generation is sized at 1/this of the total heap hint.
pub const YOUNG_GEN_FRACTION_DENOM: usize = 8;
