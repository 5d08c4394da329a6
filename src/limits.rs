pub const MAX_ITEMS: usize = 100_000;
pub const MAX_LABORS: usize = 1_000_000;
pub const MAX_MOVEMENTS_PER_ITEM: usize = 250_000;
pub const MAX_NAME_LEN: usize = 256;
pub const MAX_UNIT_LEN: usize = 32;
pub const MAX_NOTE_LEN: usize = 1024;
pub const DEFAULT_LIST_LIMIT: usize = 100;
pub const MAX_LIST_RESULTS: usize = 1_000;
/// Largest supply total, threshold or movement amount, in whole units.
pub const MAX_SUPPLY_QUANTITY: i64 = 1_000_000_000_000;
/// Decimal places kept for supply amounts. With the cap above every sum stays exact.
pub const MAX_DECIMAL_SCALE: u32 = 6;
