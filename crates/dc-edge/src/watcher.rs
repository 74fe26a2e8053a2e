// SPDX-License-Identifier: AGPL-3.0-only

//! Transaktions-Bestätigung: Kontozustand ändert sich, sobald eine
//! Transaktion in einem validierten Block gelandet ist. Gegen Forks wird
//! nur auf neu bestätigte Blöcke geschaut.

use std::time::Duration;

use tracing::debug;

use dc_crypto::Hash32;
use dc_types::{Account, Address};

use crate::EdgeError;

/// Sicht auf die validierte Kette; produktiv vom [`crate::RpcClient`]
/// implementiert, in Tests gestubbt.
#[async_trait::async_trait]
pub trait ChainView: Send + Sync {
    async fn last_valid(&self) -> (u64, Hash32);
    async fn account(&self, number: u64, addr: Address) -> Result<Account, EdgeError>;
}

/// Abbruch nach so vielen unveränderten Beobachtungen.
pub const MAX_POLLS: u32 = 15;
/// Produktions-Pollintervall.
pub const POLL_INTERVAL: Duration = Duration::from_secs(15);

/// Beobachtet `to`, bis sich dessen state_root gegenüber dem Schnappschuss
/// vor der Einreichung ändert. Liefert `true` bei Bestätigung; erneutes
/// Senden ist Sache des Einreichers.
pub async fn watch_account(
    chain: &dyn ChainView,
    to: Address,
    interval: Duration,
    max_polls: u32,
) -> bool {
    let (start_block, _) = chain.last_valid().await;
    let mut block = start_block;
    let before = chain.account(block, to).await.ok();
    let mut observations = 0u32;
    loop {
        tokio::time::sleep(interval).await;
        let (next_block, _) = chain.last_valid().await;
        if next_block == block {
            debug!(block, "waiting for next valid block");
            continue;
        }
        block = next_block;
        let current = match chain.account(block, to).await {
            Ok(account) => account,
            Err(e) => {
                debug!(block, error = %e, "account fetch failed, retrying");
                continue;
            }
        };
        match &before {
            // Konto existierte vorher nicht: jetzt da → bestätigt
            None => return true,
            Some(old) => {
                if current.state_root() != old.state_root() {
                    return true;
                }
            }
        }
        // Zustand unverändert; vielleicht leerer Block
        if observations >= max_polls {
            return false;
        }
        observations += 1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU64, Ordering};
    use std::sync::Mutex;

    /// Schreitet pro Abfrage um einen Block weiter; ab `change_at` trägt
    /// das Konto eine neue storage_root.
    struct SteppingChain {
        calls: AtomicU64,
        start: u64,
        change_at: u64,
        fail_blocks: Mutex<Vec<u64>>,
    }

    impl SteppingChain {
        fn new(start: u64, change_at: u64) -> Self {
            Self {
                calls: AtomicU64::new(0),
                start,
                change_at,
                fail_blocks: Mutex::new(Vec::new()),
            }
        }
    }

    #[async_trait::async_trait]
    impl ChainView for SteppingChain {
        async fn last_valid(&self) -> (u64, Hash32) {
            let n = self.calls.fetch_add(1, Ordering::Relaxed);
            (self.start + n, [0u8; 32])
        }

        async fn account(&self, number: u64, _addr: Address) -> Result<Account, EdgeError> {
            if self.fail_blocks.lock().expect("lock").contains(&number) {
                return Err(EdgeError::Timeout);
            }
            let root = if number >= self.change_at {
                [0xcc; 32]
            } else {
                [0x11; 32]
            };
            Ok(Account {
                nonce: 0,
                balance: 0,
                storage_root: root,
                code_hash: [0u8; 32],
            })
        }
    }

    #[tokio::test]
    async fn confirms_when_state_root_changes() {
        // Start bei 100, Root ändert sich ab Block 101
        let chain = SteppingChain::new(100, 101);
        let started = tokio::time::Instant::now();
        let confirmed = watch_account(
            &chain,
            Address([1u8; 20]),
            Duration::from_millis(20),
            MAX_POLLS,
        )
        .await;
        assert!(confirmed);
        assert!(started.elapsed() < Duration::from_secs(2));
    }

    #[tokio::test]
    async fn gives_up_after_max_polls() {
        // Root ändert sich nie im beobachteten Bereich
        let chain = SteppingChain::new(100, u64::MAX);
        let confirmed =
            watch_account(&chain, Address([1u8; 20]), Duration::from_millis(5), 3).await;
        assert!(!confirmed);
    }

    #[tokio::test]
    async fn fetch_errors_do_not_count() {
        let chain = SteppingChain::new(100, 103);
        chain.fail_blocks.lock().expect("lock").push(102);
        let confirmed =
            watch_account(&chain, Address([1u8; 20]), Duration::from_millis(5), 3).await;
        assert!(confirmed);
    }
}
