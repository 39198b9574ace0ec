//! A gateway wrapper whose calls can be made to fail or stall on demand.

use async_trait::async_trait;
use bytes::Bytes;
use cloud_drive::gateway::{
    ByteStream, CompletedPart, FilesystemGateway, GatewayError, GatewayResult, ObjectGateway,
    PartInfo,
};
use std::{
    sync::{
        Mutex,
        atomic::{AtomicU64, AtomicUsize, Ordering},
    },
    time::Duration,
};

/// What to do to the next calls of one operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[allow(dead_code)]
pub enum Fault {
    Fail,
    Stall(Duration),
}

/// Delegates to a [`FilesystemGateway`] unless a fault is scripted.
#[allow(dead_code)]
pub struct ScriptedGateway {
    inner: FilesystemGateway,
    faults: Mutex<Vec<(&'static str, Fault, usize)>>,
    forgotten_parts: Mutex<Vec<u32>>,
    upload_part_calls: AtomicUsize,
    abort_calls: AtomicUsize,
    min_part_size: AtomicU64,
}

#[allow(dead_code)]
impl ScriptedGateway {
    pub fn new(inner: FilesystemGateway) -> Self {
        Self {
            min_part_size: AtomicU64::new(inner.min_part_size()),
            inner,
            faults: Mutex::new(Vec::new()),
            forgotten_parts: Mutex::new(Vec::new()),
            upload_part_calls: AtomicUsize::new(0),
            abort_calls: AtomicUsize::new(0),
        }
    }

    /// Apply `fault` to the next `times` calls of `operation`.
    pub fn script(&self, operation: &'static str, fault: Fault, times: usize) {
        self.faults.lock().unwrap().push((operation, fault, times));
    }

    /// Behave like a backend that rejects smaller non-final parts.
    pub fn require_min_part_size(&self, bytes: u64) {
        self.min_part_size.store(bytes, Ordering::SeqCst);
    }

    /// Leave `part_number` out of every later `list_parts` answer.
    pub fn forget_part(&self, part_number: u32) {
        self.forgotten_parts.lock().unwrap().push(part_number);
    }

    pub fn upload_part_calls(&self) -> usize {
        self.upload_part_calls.load(Ordering::SeqCst)
    }

    pub fn abort_calls(&self) -> usize {
        self.abort_calls.load(Ordering::SeqCst)
    }

    fn take_fault(&self, operation: &'static str) -> Option<Fault> {
        let mut faults = self.faults.lock().unwrap();
        let slot = faults
            .iter_mut()
            .find(|(op, _, remaining)| *op == operation && *remaining > 0)?;
        slot.2 -= 1;
        Some(slot.1)
    }

    async fn gate(&self, operation: &'static str) -> GatewayResult<()> {
        match self.take_fault(operation) {
            None => Ok(()),
            Some(Fault::Fail) => Err(GatewayError::Io(std::io::Error::other(format!(
                "scripted {operation} failure"
            )))),
            Some(Fault::Stall(pause)) => {
                tokio::time::sleep(pause).await;
                Ok(())
            }
        }
    }
}

#[async_trait]
impl ObjectGateway for ScriptedGateway {
    async fn initiate(&self, key: &str) -> GatewayResult<String> {
        self.gate("initiate").await?;
        self.inner.initiate(key).await
    }

    async fn upload_part(
        &self,
        key: &str,
        upload_id: &str,
        part_number: u32,
        data: Bytes,
    ) -> GatewayResult<String> {
        self.upload_part_calls.fetch_add(1, Ordering::SeqCst);
        self.gate("upload_part").await?;
        self.inner.upload_part(key, upload_id, part_number, data).await
    }

    async fn list_parts(&self, key: &str, upload_id: &str) -> GatewayResult<Vec<PartInfo>> {
        self.gate("list_parts").await?;
        let forgotten = self.forgotten_parts.lock().unwrap().clone();
        let mut parts = self.inner.list_parts(key, upload_id).await?;
        parts.retain(|part| !forgotten.contains(&part.part_number));
        Ok(parts)
    }

    async fn complete(
        &self,
        key: &str,
        upload_id: &str,
        parts: &[CompletedPart],
    ) -> GatewayResult<String> {
        self.gate("complete").await?;
        self.inner.complete(key, upload_id, parts).await
    }

    async fn abort(&self, key: &str, upload_id: &str) -> GatewayResult<()> {
        self.abort_calls.fetch_add(1, Ordering::SeqCst);
        self.gate("abort").await?;
        self.inner.abort(key, upload_id).await
    }

    async fn put(&self, key: &str, data: Bytes) -> GatewayResult<String> {
        self.gate("put").await?;
        self.inner.put(key, data).await
    }

    async fn get(&self, key: &str) -> GatewayResult<ByteStream> {
        self.gate("get").await?;
        self.inner.get(key).await
    }

    async fn delete(&self, key: &str) -> GatewayResult<()> {
        self.gate("delete").await?;
        self.inner.delete(key).await
    }

    async fn exists(&self, key: &str) -> GatewayResult<bool> {
        self.gate("exists").await?;
        self.inner.exists(key).await
    }

    fn backend_name(&self) -> &'static str {
        "scripted"
    }

    fn min_part_size(&self) -> u64 {
        self.min_part_size.load(Ordering::SeqCst)
    }
}
