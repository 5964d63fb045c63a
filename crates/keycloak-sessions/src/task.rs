//! Update tasks: what to change in a session entity and how to ship it.

use std::marker::PhantomData;

use keycloak_core::CacheOperation;
use serde::{Deserialize, Serialize};

use crate::entities::{LoginFailureEntity, SessionEntity};
use crate::wrapper::SessionEntityWrapper;

/// How an applied change reaches the other datacenters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CrossDcMessageStatus {
    /// Caller waits for the remote acknowledgement.
    Sync,
    /// Fire and forget.
    Async,
    /// Stays in this datacenter.
    NotNeeded,
}

/// A change to one session entity.
pub trait SessionUpdateTask<E: SessionEntity>: Send + Sync {
    /// Mutates the entity. Called again on every compare-and-swap retry.
    fn run_update(&self, entity: &mut E);

    /// Operation to perform. `wrapper` is `None` when no entry exists yet.
    fn operation(&self, wrapper: Option<&SessionEntityWrapper<E>>) -> CacheOperation;

    fn cross_dc_status(&self, _wrapper: &SessionEntityWrapper<E>) -> CrossDcMessageStatus {
        E::KIND.default_cross_dc()
    }
}

/// Task built from a fixed operation and an update closure.
pub struct UpdateTask<E, F> {
    operation: CacheOperation,
    update: F,
    cross_dc: Option<CrossDcMessageStatus>,
    _entity: PhantomData<fn(&mut E)>,
}

impl<E: SessionEntity> UpdateTask<E, fn(&mut E)> {
    pub fn add() -> Self {
        Self::with_operation(CacheOperation::Add, |_| {})
    }

    pub fn add_if_absent() -> Self {
        Self::with_operation(CacheOperation::AddIfAbsent, |_| {})
    }

    pub fn remove() -> Self {
        Self::with_operation(CacheOperation::Remove, |_| {})
    }
}

impl<E, F> UpdateTask<E, F>
where
    E: SessionEntity,
    F: Fn(&mut E) + Send + Sync,
{
    pub fn replace(update: F) -> Self {
        Self::with_operation(CacheOperation::Replace, update)
    }

    pub fn with_operation(operation: CacheOperation, update: F) -> Self {
        Self {
            operation,
            update,
            cross_dc: None,
            _entity: PhantomData,
        }
    }

    /// Overrides the per-kind propagation policy.
    pub fn cross_dc(mut self, status: CrossDcMessageStatus) -> Self {
        self.cross_dc = Some(status);
        self
    }
}

impl<E, F> SessionUpdateTask<E> for UpdateTask<E, F>
where
    E: SessionEntity,
    F: Fn(&mut E) + Send + Sync,
{
    fn run_update(&self, entity: &mut E) {
        (self.update)(entity);
    }

    fn operation(&self, _wrapper: Option<&SessionEntityWrapper<E>>) -> CacheOperation {
        self.operation
    }

    fn cross_dc_status(&self, _wrapper: &SessionEntityWrapper<E>) -> CrossDcMessageStatus {
        self.cross_dc.unwrap_or(E::KIND.default_cross_dc())
    }
}

/// Login-failure update: always a replace, always propagated synchronously.
pub struct LoginFailuresUpdateTask<F> {
    update: F,
}

impl<F> LoginFailuresUpdateTask<F>
where
    F: Fn(&mut LoginFailureEntity) + Send + Sync,
{
    pub fn new(update: F) -> Self {
        Self { update }
    }
}

impl<F> SessionUpdateTask<LoginFailureEntity> for LoginFailuresUpdateTask<F>
where
    F: Fn(&mut LoginFailureEntity) + Send + Sync,
{
    fn run_update(&self, entity: &mut LoginFailureEntity) {
        (self.update)(entity);
    }

    fn operation(
        &self,
        _wrapper: Option<&SessionEntityWrapper<LoginFailureEntity>>,
    ) -> CacheOperation {
        CacheOperation::Replace
    }

    fn cross_dc_status(
        &self,
        _wrapper: &SessionEntityWrapper<LoginFailureEntity>,
    ) -> CrossDcMessageStatus {
        CrossDcMessageStatus::Sync
    }
}
