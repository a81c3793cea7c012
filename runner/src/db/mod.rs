pub mod klines;
pub mod logs;
pub mod models;
pub mod positions;
pub mod runs;

pub use klines::{KlineStore, KlineStoreError, PgKlineStore};
pub use logs::{LogStore, LogStoreError, PgLogStore};
pub use models::{Candle, ClaimedProject, LogLevel, Position, PositionStatus, Run, RunStatus, SeriesKey};
pub use positions::{PgPositionStore, PositionStore, PositionStoreError};
pub use runs::{PgRunStore, RunStore, RunStoreError};
