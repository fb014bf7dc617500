//! Module substitutions visible only along one render's async call chain.
//!
//! The table travels with the future passed to [`with_module_mocks`] through
//! a task-local slot. Code polled inside that future sees it; code running in
//! another task (including tasks spawned from inside the scope) does not. When
//! the scoped future finishes, errors, or panics, the table is gone.

use std::{collections::BTreeMap, future::Future, sync::Arc};

/// Specifier to replacement path.
pub type ModuleMocks = BTreeMap<String, String>;

tokio::task_local! {
    static MODULE_MOCKS: Arc<ModuleMocks>;
}

/// Run `future` with `mocks` as the innermost module-mock table.
pub async fn with_module_mocks<F, T>(mocks: Arc<ModuleMocks>, future: F) -> T
where
    F: Future<Output = T>,
{
    MODULE_MOCKS.scope(mocks, future).await
}

/// Replacement registered for `specifier` by the innermost enclosing scope.
pub fn resolve_module_mock(specifier: &str) -> Option<String> {
    MODULE_MOCKS
        .try_with(|mocks| mocks.get(specifier).cloned())
        .ok()
        .flatten()
}

/// The whole innermost table, if any scope is active.
pub fn current_module_mocks() -> Option<Arc<ModuleMocks>> {
    MODULE_MOCKS.try_with(Arc::clone).ok()
}
