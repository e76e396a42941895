//! Warm VM pool.
//!
//! Two collections behind one mutex: a LIFO stack of warm (ready) VMs and a
//! map of active VMs keyed by id, plus a count of in-flight creations so the
//! slot ceiling holds while a VM is being built outside the lock.
//!
//! A released VM is always destroyed: the guest agent serves exactly one
//! task and exits, so its vsock listener is dead afterwards.

use std::collections::HashMap;
use std::path::PathBuf;

use tokio::sync::Mutex;
use tracing::{info, warn};
use uuid::Uuid;

use crate::catalog::SnapshotCatalog;
use crate::error::{Result, VmError};
use crate::instance::{VmConfig, VmInstance};

/// Consecutive restore failures after which warm-up gives up rather than
/// spinning on a broken environment.
const MAX_CONSECUTIVE_FAILURES: u32 = 3;

/// Pool sizing.
#[derive(Debug, Clone, Copy)]
pub struct PoolConfig {
    /// Hard ceiling on warm + active VMs.
    pub total_vm_slots: usize,
    /// Desired number of warm VMs.
    pub warm_pool_target: usize,
}

/// What a task borrows from the pool: enough to reach the VM's guest agent.
/// The pool keeps ownership of the instance until [`VmPool::release`].
#[derive(Debug, Clone)]
pub struct VmHandle {
    pub id: Uuid,
    pub vsock_path: PathBuf,
    pub cid: u32,
}

#[derive(Default)]
struct PoolInner {
    warm: Vec<VmInstance>,
    active: HashMap<Uuid, VmInstance>,
    /// VMs being created outside the lock; counted against the slot ceiling.
    creating: usize,
}

impl PoolInner {
    fn occupied(&self) -> usize {
        self.warm.len() + self.active.len() + self.creating
    }
}

pub struct VmPool {
    vm_config: VmConfig,
    pool_config: PoolConfig,
    catalog: SnapshotCatalog,
    inner: Mutex<PoolInner>,
}

impl VmPool {
    pub fn new(vm_config: VmConfig, pool_config: PoolConfig, catalog: SnapshotCatalog) -> Self {
        Self {
            vm_config,
            pool_config,
            catalog,
            inner: Mutex::new(PoolInner::default()),
        }
    }

    pub fn warm_pool_target(&self) -> usize {
        self.pool_config.warm_pool_target
    }

    pub fn total_vm_slots(&self) -> usize {
        self.pool_config.total_vm_slots
    }

    /// Restore VMs until the warm stack holds `target`, the slot ceiling is
    /// reached, or [`MAX_CONSECUTIVE_FAILURES`] restores fail in a row.
    pub async fn warm_pool(&self, target: usize) -> Result<()> {
        let target = target.min(self.pool_config.total_vm_slots);
        let mut consecutive_failures = 0u32;

        loop {
            {
                let mut inner = self.inner.lock().await;
                if inner.warm.len() >= target
                    || inner.occupied() >= self.pool_config.total_vm_slots
                {
                    return Ok(());
                }
                inner.creating += 1;
            }

            let result = self.create_restored_vm().await;

            let mut inner = self.inner.lock().await;
            inner.creating -= 1;
            match result {
                Ok(vm) => {
                    consecutive_failures = 0;
                    info!(id = %vm.id().simple(), warm = inner.warm.len() + 1, "warm vm added");
                    inner.warm.push(vm);
                }
                Err(e) => {
                    consecutive_failures += 1;
                    warn!(error = %e, consecutive_failures, "warm vm creation failed");
                    if consecutive_failures >= MAX_CONSECUTIVE_FAILURES {
                        return Err(e);
                    }
                }
            }
        }
    }

    /// Hand out a VM for `task_id`: pop a warm one, or create a fresh one
    /// when below the slot ceiling. The creation happens outside the pool
    /// mutex so other callers are not blocked behind a multi-second boot.
    pub async fn acquire_or_create(&self, task_id: Uuid) -> Result<VmHandle> {
        {
            let mut inner = self.inner.lock().await;
            if let Some(mut vm) = inner.warm.pop() {
                vm.assign_task(task_id)?;
                let handle = handle_of(&vm);
                inner.active.insert(vm.id(), vm);
                return Ok(handle);
            }
            if inner.occupied() >= self.pool_config.total_vm_slots {
                return Err(VmError::NoAvailableVm);
            }
            inner.creating += 1;
        }

        let result = self.create_restored_vm().await;

        let mut inner = self.inner.lock().await;
        inner.creating -= 1;
        let mut vm = result?;
        vm.assign_task(task_id)?;
        let handle = handle_of(&vm);
        inner.active.insert(vm.id(), vm);
        Ok(handle)
    }

    /// Destroy the released VM, then top the warm stack back up when below
    /// both the slot ceiling and the warm target.
    pub async fn release(&self, id: Uuid) {
        let vm = self.inner.lock().await.active.remove(&id);
        match vm {
            Some(mut vm) => {
                vm.release_task();
                vm.stop().await;
                info!(id = %id.simple(), "vm destroyed after task");
            }
            None => {
                warn!(id = %id.simple(), "release of unknown vm ignored");
                return;
            }
        }

        let should_replenish = {
            let mut inner = self.inner.lock().await;
            let below_ceiling = inner.occupied() < self.pool_config.total_vm_slots;
            let below_target = inner.warm.len() < self.pool_config.warm_pool_target;
            if below_ceiling && below_target {
                inner.creating += 1;
                true
            } else {
                false
            }
        };

        if should_replenish {
            let result = self.create_restored_vm().await;
            let mut inner = self.inner.lock().await;
            inner.creating -= 1;
            match result {
                Ok(vm) => {
                    info!(id = %vm.id().simple(), "warm pool replenished");
                    inner.warm.push(vm);
                }
                Err(e) => warn!(error = %e, "warm pool replenish failed"),
            }
        }
    }

    /// Stop every VM, warm and active. Used at node shutdown.
    pub async fn shutdown(&self) {
        let (warm, active) = {
            let mut inner = self.inner.lock().await;
            (
                std::mem::take(&mut inner.warm),
                std::mem::take(&mut inner.active),
            )
        };
        for mut vm in warm.into_iter().chain(active.into_values()) {
            vm.stop().await;
        }
        info!("vm pool shut down");
    }

    pub async fn warm_count(&self) -> usize {
        self.inner.lock().await.warm.len()
    }

    pub async fn active_count(&self) -> usize {
        self.inner.lock().await.active.len()
    }

    pub async fn total_count(&self) -> usize {
        let inner = self.inner.lock().await;
        inner.warm.len() + inner.active.len()
    }

    /// Build one VM from the default snapshot, cold-booting when the catalog
    /// has no `base` entry.
    async fn create_restored_vm(&self) -> Result<VmInstance> {
        let mut vm = VmInstance::new()?;
        match self.catalog.default_snapshot() {
            Some(snapshot) => vm.restore(&self.vm_config, snapshot).await?,
            None => vm.boot(&self.vm_config).await?,
        }
        Ok(vm)
    }
}

fn handle_of(vm: &VmInstance) -> VmHandle {
    VmHandle {
        id: vm.id(),
        vsock_path: vm.vsock_path().to_path_buf(),
        cid: vm.cid(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::Path;

    async fn test_pool(slots: usize, warm_target: usize) -> VmPool {
        let dir = tempfile::tempdir().unwrap();
        let catalog = SnapshotCatalog::load(dir.path()).await.unwrap();
        VmPool::new(
            VmConfig {
                firecracker_bin: Path::new("/nonexistent/firecracker").to_path_buf(),
                kernel_path: Path::new("/nonexistent/vmlinux").to_path_buf(),
                rootfs_path: Path::new("/nonexistent/rootfs.ext4").to_path_buf(),
                vcpu_count: 1,
                mem_size_mib: 128,
            },
            PoolConfig {
                total_vm_slots: slots,
                warm_pool_target: warm_target,
            },
            catalog,
        )
    }

    /// Push ready instances straight into the warm stack, bypassing boot.
    async fn seed_warm(pool: &VmPool, count: usize) -> Vec<Uuid> {
        let mut ids = Vec::new();
        let mut inner = pool.inner.lock().await;
        for _ in 0..count {
            let mut vm = VmInstance::new().unwrap();
            vm.mark_ready();
            ids.push(vm.id());
            inner.warm.push(vm);
        }
        ids
    }

    #[tokio::test]
    async fn acquire_pops_warm_vm() {
        let pool = test_pool(4, 0).await;
        let ids = seed_warm(&pool, 2).await;

        let task = Uuid::new_v4();
        let handle = pool.acquire_or_create(task).await.unwrap();
        assert!(ids.contains(&handle.id));
        assert_eq!(pool.warm_count().await, 1);
        assert_eq!(pool.active_count().await, 1);

        let inner = pool.inner.lock().await;
        assert_eq!(inner.active.get(&handle.id).unwrap().task_id(), Some(task));
    }

    #[tokio::test]
    async fn acquire_fails_when_ceiling_reached() {
        let pool = test_pool(2, 0).await;
        seed_warm(&pool, 2).await;

        pool.acquire_or_create(Uuid::new_v4()).await.unwrap();
        pool.acquire_or_create(Uuid::new_v4()).await.unwrap();

        let err = pool.acquire_or_create(Uuid::new_v4()).await.unwrap_err();
        assert!(matches!(err, VmError::NoAvailableVm));
        assert_eq!(pool.total_count().await, 2);
    }

    #[tokio::test]
    async fn acquire_create_fails_without_firecracker() {
        // Empty warm stack, free slots: the pool tries to build a VM and
        // surfaces the artifact error.
        let pool = test_pool(2, 0).await;
        let err = pool.acquire_or_create(Uuid::new_v4()).await.unwrap_err();
        assert!(matches!(err, VmError::FirecrackerNotFound(_)));
        // Failed creation must not leak a slot reservation.
        assert_eq!(pool.inner.lock().await.creating, 0);
        assert_eq!(pool.total_count().await, 0);
    }

    #[tokio::test]
    async fn release_destroys_and_never_reuses_vm() {
        let pool = test_pool(4, 0).await;
        let ids = seed_warm(&pool, 2).await;

        let first = pool.acquire_or_create(Uuid::new_v4()).await.unwrap();
        pool.release(first.id).await;

        // The released id is in neither collection.
        {
            let inner = pool.inner.lock().await;
            assert!(!inner.active.contains_key(&first.id));
            assert!(inner.warm.iter().all(|vm| vm.id() != first.id));
        }

        // A subsequent acquire returns the other pre-seeded VM.
        let second = pool.acquire_or_create(Uuid::new_v4()).await.unwrap();
        assert_ne!(second.id, first.id);
        assert!(ids.contains(&second.id));
    }

    #[tokio::test]
    async fn release_of_unknown_id_is_ignored() {
        let pool = test_pool(2, 0).await;
        pool.release(Uuid::new_v4()).await;
        assert_eq!(pool.total_count().await, 0);
    }

    #[tokio::test]
    async fn release_replenish_failure_is_not_fatal() {
        // warm_pool_target > 0 makes release try to replenish; with no
        // firecracker binary the attempt fails and is only logged.
        let pool = test_pool(4, 2).await;
        seed_warm(&pool, 1).await;

        let handle = pool.acquire_or_create(Uuid::new_v4()).await.unwrap();
        pool.release(handle.id).await;

        assert_eq!(pool.warm_count().await, 0);
        assert_eq!(pool.active_count().await, 0);
        assert_eq!(pool.inner.lock().await.creating, 0);
    }

    #[tokio::test]
    async fn warm_pool_aborts_after_consecutive_failures() {
        let pool = test_pool(8, 0).await;
        let err = pool.warm_pool(4).await.unwrap_err();
        assert!(matches!(err, VmError::FirecrackerNotFound(_)));
        assert_eq!(pool.warm_count().await, 0);
        assert_eq!(pool.inner.lock().await.creating, 0);
    }

    #[tokio::test]
    async fn warm_pool_is_satisfied_by_existing_warm_vms() {
        let pool = test_pool(8, 4).await;
        seed_warm(&pool, 4).await;
        pool.warm_pool(4).await.unwrap();
        assert_eq!(pool.warm_count().await, 4);
    }

    #[tokio::test]
    async fn warm_pool_target_is_capped_by_slots() {
        let pool = test_pool(2, 0).await;
        seed_warm(&pool, 2).await;
        // target 10 > slots 2: already satisfied, no creation attempted.
        pool.warm_pool(10).await.unwrap();
        assert_eq!(pool.warm_count().await, 2);
    }

    #[tokio::test]
    async fn counters_track_warm_and_active() {
        let pool = test_pool(4, 0).await;
        seed_warm(&pool, 3).await;
        assert_eq!(pool.warm_count().await, 3);
        assert_eq!(pool.active_count().await, 0);
        assert_eq!(pool.total_count().await, 3);

        pool.acquire_or_create(Uuid::new_v4()).await.unwrap();
        assert_eq!(pool.warm_count().await, 2);
        assert_eq!(pool.active_count().await, 1);
        assert_eq!(pool.total_count().await, 3);
    }
}
