//! Link Guardian.
//!
//! Owns the single controller link and serializes every operation on it.
//! The link itself is never handed out: callers get operation-level methods
//! ([`LinkGuardian::read_bitmap`], [`LinkGuardian::write_bit`], ...) or a
//! scoped [`LinkGuardian::with_link`] whose borrow ends with the lock.
//!
//! Cloning a guardian clones the handle, not the link. The poller and every
//! sampling task hold clones of the same guardian.

use crate::address::BitAddress;
use crate::error::{AppResult, DaqError};
use crate::link::{AddressableLink, LinkError};
use crate::stats::AcquisitionStats;
use futures::future::BoxFuture;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, warn};

/// Exclusive-access wrapper around an [`AddressableLink`].
pub struct LinkGuardian<L> {
    link: Arc<Mutex<L>>,
    stats: Arc<AcquisitionStats>,
}

impl<L> Clone for LinkGuardian<L> {
    fn clone(&self) -> Self {
        Self {
            link: Arc::clone(&self.link),
            stats: Arc::clone(&self.stats),
        }
    }
}

impl<L> LinkGuardian<L>
where
    L: AddressableLink + 'static,
{
    /// Take ownership of `link`.
    pub fn new(link: L, stats: Arc<AcquisitionStats>) -> Self {
        Self {
            link: Arc::new(Mutex::new(link)),
            stats,
        }
    }

    /// Run `op` against the live link while holding exclusive access.
    ///
    /// While disconnected, `op` is not invoked and [`LinkError::NotConnected`]
    /// is returned. A failure that means the connection is gone also
    /// disconnects the link, so the next poll cycle goes through
    /// [`LinkGuardian::ensure_connected`].
    pub async fn with_link<T, F>(&self, op: F) -> Result<T, LinkError>
    where
        T: Send,
        F: for<'a> FnOnce(&'a mut L) -> BoxFuture<'a, Result<T, LinkError>> + Send,
    {
        let mut link = self.link.lock().await;
        if !link.is_connected() {
            return Err(LinkError::NotConnected);
        }
        let result = op(&mut *link).await;
        if let Err(err) = &result {
            if err.is_connection_loss() {
                warn!(error = %err, "Link lost");
                self.stats.record_link_loss();
                if link.is_connected() {
                    link.disconnect().await;
                }
            }
        }
        result
    }

    /// Connect if not connected. One attempt, no internal retry.
    pub async fn ensure_connected(&self) -> AppResult<()> {
        let mut link = self.link.lock().await;
        if link.is_connected() {
            return Ok(());
        }
        match link.connect().await {
            Ok(()) => {
                self.stats.record_connect_attempt(true);
                debug!("Link connected");
                Ok(())
            }
            Err(err) => {
                self.stats.record_connect_attempt(false);
                Err(DaqError::link_unavailable(err))
            }
        }
    }

    /// Current connection state.
    pub async fn is_connected(&self) -> bool {
        self.link.lock().await.is_connected()
    }

    /// Release the link.
    pub async fn disconnect(&self) {
        self.link.lock().await.disconnect().await;
    }

    /// Read one bit.
    pub async fn read_bit(&self, region: u16, address: BitAddress) -> Result<bool, LinkError> {
        self.with_link(move |link| link.read_bit(region, address.byte, address.bit))
            .await
    }

    /// Write one bit. Idempotent.
    pub async fn write_bit(
        &self,
        region: u16,
        address: BitAddress,
        value: bool,
    ) -> Result<(), LinkError> {
        self.with_link(move |link| link.write_bit(region, address.byte, address.bit, value))
            .await
    }

    /// Read a signed 16-bit integer.
    pub async fn read_word16(&self, region: u16, offset: u32) -> Result<i16, LinkError> {
        self.with_link(move |link| link.read_word16(region, offset))
            .await
    }

    /// Read a fixed-length text field.
    pub async fn read_text(&self, region: u16, offset: u32, len: u32) -> Result<String, LinkError> {
        self.with_link(move |link| link.read_text(region, offset, len))
            .await
    }

    /// Read a bitmap of `byte_len` bytes.
    pub async fn read_bitmap(
        &self,
        region: u16,
        offset: u32,
        byte_len: u32,
    ) -> Result<Vec<bool>, LinkError> {
        self.with_link(move |link| link.read_bitmap(region, offset, byte_len))
            .await
    }

    /// Read four consecutive floats.
    pub async fn read_floats4(&self, region: u16, offset: u32) -> Result<[f32; 4], LinkError> {
        self.with_link(move |link| link.read_floats4(region, offset))
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::link::MockPlc;
    use std::time::Duration;

    fn guardian(plc: &MockPlc) -> LinkGuardian<MockPlc> {
        LinkGuardian::new(plc.clone(), Arc::new(AcquisitionStats::new()))
    }

    #[tokio::test]
    async fn ensure_connected_is_single_attempt() {
        let plc = MockPlc::with_region(1);
        plc.refuse_connect(true);
        let guardian = guardian(&plc);

        let err = guardian.ensure_connected().await.unwrap_err();
        assert!(matches!(err, DaqError::LinkUnavailable(_)));
        assert_eq!(plc.connect_attempts(), 1);
        assert_eq!(guardian.stats.snapshot().connect_failures, 1);

        plc.refuse_connect(false);
        guardian.ensure_connected().await.unwrap();
        guardian.ensure_connected().await.unwrap();
        assert_eq!(plc.connect_attempts(), 2);
        assert!(guardian.is_connected().await);
    }

    #[tokio::test]
    async fn operations_reach_the_link() {
        let plc = MockPlc::with_region(1);
        plc.set_word16(1, 10, 42);
        plc.set_text(1, 20, 8, "BOX-001");
        let guardian = guardian(&plc);
        guardian.ensure_connected().await.unwrap();

        assert_eq!(guardian.read_word16(1, 10).await.unwrap(), 42);
        assert_eq!(guardian.read_text(1, 20, 8).await.unwrap(), "BOX-001");

        let bit = BitAddress::new(2, 3);
        guardian.write_bit(1, bit, true).await.unwrap();
        assert!(guardian.read_bit(1, bit).await.unwrap());
        assert!(plc.bit(1, bit));
    }

    #[tokio::test]
    async fn failed_operation_leaves_guardian_usable() {
        let plc = MockPlc::with_region(1);
        let guardian = guardian(&plc);
        guardian.ensure_connected().await.unwrap();

        assert!(matches!(
            guardian.read_word16(1, 5000).await,
            Err(LinkError::OutOfRange { .. })
        ));
        // Non-connection errors keep the link up.
        assert!(guardian.is_connected().await);

        plc.drop_connection();
        let reads_before = plc.read_count();
        assert!(matches!(
            guardian.read_word16(1, 0).await,
            Err(LinkError::NotConnected)
        ));
        assert_eq!(plc.read_count(), reads_before, "no read issued while down");
        guardian.ensure_connected().await.unwrap();
        assert_eq!(guardian.read_word16(1, 0).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn with_link_runs_composite_operations() {
        let plc = MockPlc::with_region(1);
        plc.set_word16(1, 0, 7);
        let guardian = guardian(&plc);
        guardian.ensure_connected().await.unwrap();

        let sum = guardian
            .with_link(|link| {
                Box::pin(async move {
                    let a = link.read_word16(1, 0).await?;
                    let b = link.read_word16(1, 0).await?;
                    Ok::<_, LinkError>(i32::from(a) + i32::from(b))
                })
            })
            .await
            .unwrap();
        assert_eq!(sum, 14);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_callers_never_overlap() {
        let plc = MockPlc::with_region(1).with_latency(Duration::from_millis(2));
        let guardian = guardian(&plc);
        guardian.ensure_connected().await.unwrap();

        let mut handles = Vec::new();
        for i in 0..8u32 {
            let g = guardian.clone();
            handles.push(tokio::spawn(async move {
                for _ in 0..5 {
                    let _ = g.read_floats4(1, 4 + i * 16).await;
                    let _ = g.write_bit(1, BitAddress::new(0, (i % 8) as u8), false).await;
                }
            }));
        }
        for h in handles {
            h.await.unwrap();
        }
        assert_eq!(plc.overlap_violations(), 0);
        assert_eq!(plc.read_count(), 40);
    }
}
