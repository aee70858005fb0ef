//! Instrument mapper: symbol + exchange to broker scrip code.
//!
//! Read-mostly. The whole active table is held in one `Arc`d map and
//! swapped copy-on-write when the generation counter is bumped by an
//! out-of-band refresh; resolvers never block a reload for long.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use thiserror::Error;
use tokio::sync::RwLock;

use crate::db::{Database, StoreError};
use crate::models::{Exchange, InstrumentCode};

#[derive(Debug, Error)]
pub enum InstrumentError {
    #[error("unknown instrument {symbol} on {exchange}")]
    Unknown { symbol: String, exchange: String },

    #[error(transparent)]
    Store(#[from] StoreError),
}

type CodeMap = ahash::AHashMap<(String, Exchange), InstrumentCode>;

#[derive(Default)]
struct CacheState {
    generation: u64,
    codes: Arc<CodeMap>,
}

/// Resolves trading symbols to broker instrument codes with a generation-
/// stamped in-process cache over the instrument store.
pub struct InstrumentMapper {
    db: Database,
    generation: AtomicU64,
    cache: RwLock<CacheState>,
}

impl InstrumentMapper {
    pub fn new(db: Database) -> Self {
        Self {
            db,
            generation: AtomicU64::new(1),
            cache: RwLock::new(CacheState::default()),
        }
    }

    /// Invalidate the cache; the next resolve reloads from the store.
    pub fn bump_generation(&self) {
        self.generation.fetch_add(1, Ordering::SeqCst);
    }

    /// Resolve a symbol to its instrument code and lot size.
    ///
    /// A hit serves from the generation-current snapshot; a miss falls
    /// through to the store once and is folded into a fresh copy of the
    /// snapshot. Changed rows stay invisible until the generation bump
    /// that accompanies the out-of-band refresh.
    pub async fn resolve(
        &self,
        symbol: &str,
        exchange: Exchange,
    ) -> Result<InstrumentCode, InstrumentError> {
        let current = self.generation.load(Ordering::SeqCst);
        let key = (symbol.to_string(), exchange);

        {
            let cache = self.cache.read().await;
            if cache.generation == current {
                if let Some(code) = cache.codes.get(&key) {
                    return Ok(code.clone());
                }
            }
        }

        let mut cache = self.cache.write().await;
        if cache.generation != current {
            // Stale snapshot: reload the whole active table.
            let mut codes = CodeMap::default();
            for row in self.db.list_active_instruments().await? {
                codes.insert((row.symbol.clone(), row.exchange), row);
            }
            cache.generation = current;
            cache.codes = Arc::new(codes);
            tracing::debug!(
                count = cache.codes.len(),
                generation = current,
                "instrument cache reloaded"
            );
        }
        if let Some(code) = cache.codes.get(&key) {
            return Ok(code.clone());
        }

        // Cache miss: read through to the store and fold the row in.
        match self.db.get_instrument(symbol, exchange).await? {
            Some(code) => {
                let mut codes = CodeMap::clone(&cache.codes);
                codes.insert(key, code.clone());
                cache.codes = Arc::new(codes);
                Ok(code)
            }
            None => Err(InstrumentError::Unknown {
                symbol: symbol.to_string(),
                exchange: exchange.as_str().to_string(),
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    async fn db_with_instrument(symbol: &str, scrip_code: i64, lot_size: i64) -> Database {
        let db = Database::in_memory().await.unwrap();
        db.save_instrument(&InstrumentCode {
            symbol: symbol.to_string(),
            exchange: Exchange::Nse,
            segment: "C".to_string(),
            scrip_code,
            lot_size,
            active: true,
            updated_at: Utc::now(),
        })
        .await
        .unwrap();
        db
    }

    #[tokio::test]
    async fn resolves_known_symbol() {
        let db = db_with_instrument("RELIANCE", 2885, 1).await;
        let mapper = InstrumentMapper::new(db);
        let code = mapper.resolve("RELIANCE", Exchange::Nse).await.unwrap();
        assert_eq!(code.scrip_code, 2885);
        assert_eq!(code.lot_size, 1);
    }

    #[tokio::test]
    async fn unknown_symbol_fails() {
        let db = db_with_instrument("RELIANCE", 2885, 1).await;
        let mapper = InstrumentMapper::new(db);
        let err = mapper.resolve("NOPE", Exchange::Nse).await.unwrap_err();
        assert!(matches!(err, InstrumentError::Unknown { .. }));
    }

    #[tokio::test]
    async fn misses_read_through_to_the_store() {
        let db = db_with_instrument("RELIANCE", 2885, 1).await;
        let mapper = InstrumentMapper::new(db.clone());
        assert!(mapper.resolve("TCS", Exchange::Nse).await.is_err());

        db.save_instrument(&InstrumentCode {
            symbol: "TCS".to_string(),
            exchange: Exchange::Nse,
            segment: "C".to_string(),
            scrip_code: 11536,
            lot_size: 1,
            active: true,
            updated_at: Utc::now(),
        })
        .await
        .unwrap();

        // A never-cached symbol is found via read-through.
        assert_eq!(
            mapper.resolve("TCS", Exchange::Nse).await.unwrap().scrip_code,
            11536
        );
    }

    #[tokio::test]
    async fn updates_invisible_until_generation_bump() {
        let db = db_with_instrument("RELIANCE", 2885, 1).await;
        let mapper = InstrumentMapper::new(db.clone());
        assert_eq!(
            mapper.resolve("RELIANCE", Exchange::Nse).await.unwrap().lot_size,
            1
        );

        db.save_instrument(&InstrumentCode {
            symbol: "RELIANCE".to_string(),
            exchange: Exchange::Nse,
            segment: "C".to_string(),
            scrip_code: 2885,
            lot_size: 5,
            active: true,
            updated_at: Utc::now(),
        })
        .await
        .unwrap();

        // The cached row is served until the refresh bumps the generation.
        assert_eq!(
            mapper.resolve("RELIANCE", Exchange::Nse).await.unwrap().lot_size,
            1
        );
        mapper.bump_generation();
        assert_eq!(
            mapper.resolve("RELIANCE", Exchange::Nse).await.unwrap().lot_size,
            5
        );
    }
}
