//! The scope a method is compiled in: an ordinary module, or the resolver of a
//! dynamic method.
use crate::{
    error::Result,
    method::DynamicMethodDesc,
    resolver::DynamicResolver,
    utils::{sync::Arc, MethodSlot, ModuleId},
};

#[derive(Clone, Debug)]
pub enum ScopeHandle {
    Module(ModuleId),
    Dynamic(Arc<DynamicMethodDesc>),
}

impl ScopeHandle {
    pub fn for_method(desc: &Arc<DynamicMethodDesc>) -> Self {
        ScopeHandle::Dynamic(desc.clone())
    }

    pub fn is_dynamic_scope(&self) -> bool {
        matches!(self, ScopeHandle::Dynamic(_))
    }

    pub fn dynamic_method(&self) -> Option<MethodSlot> {
        match self {
            ScopeHandle::Module(_) => None,
            ScopeHandle::Dynamic(desc) => Some(desc.slot()),
        }
    }

    /// Ordinary modules are always access checked; dynamic scopes ask their
    /// resolver.
    pub fn requires_access_check(&self) -> Result<bool> {
        match self {
            ScopeHandle::Module(_) => Ok(true),
            ScopeHandle::Dynamic(desc) => desc.with_resolver(|r| r.requires_access_check()),
        }
    }

    /// The module that hosts the scope. Dynamic methods report the module of
    /// their owning table.
    pub fn module_of(&self) -> ModuleId {
        match self {
            ScopeHandle::Module(module) => *module,
            ScopeHandle::Dynamic(desc) => desc.module(),
        }
    }
}

impl From<ModuleId> for ScopeHandle {
    fn from(module: ModuleId) -> Self {
        ScopeHandle::Module(module)
    }
}

impl PartialEq for ScopeHandle {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (ScopeHandle::Module(a), ScopeHandle::Module(b)) => a == b,
            (ScopeHandle::Dynamic(a), ScopeHandle::Dynamic(b)) => Arc::ptr_eq(a, b),
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        config::DynamicMethodConfig,
        error::StateError,
        metrics::DynamicMethodMetrics,
        services::{ManagedCodeInfo, RuntimeServices, StaticTokenTable},
        table::DynamicMethodTable,
    };

    #[test]
    fn test_module_scope() {
        let scope = ScopeHandle::from(ModuleId(4));
        assert!(!scope.is_dynamic_scope());
        assert_eq!(scope.requires_access_check(), Ok(true));
        assert_eq!(scope.module_of(), ModuleId(4));
        assert_eq!(scope.dynamic_method(), None);
    }

    #[test]
    fn test_dynamic_scope_reports_table_module() {
        let table = DynamicMethodTable::create(
            ModuleId(9),
            RuntimeServices::in_process(),
            DynamicMethodConfig::default(),
            Arc::new(DynamicMethodMetrics::new()),
        );
        let bare = table.get_dynamic_method(&[], "bare").unwrap();
        let bare_scope = ScopeHandle::for_method(&bare);
        assert_eq!(
            bare_scope.requires_access_check(),
            Err(StateError::NoResolver.into())
        );

        let stub = table
            .create_il_stub(&[], "stub", StaticTokenTable::new(ManagedCodeInfo::default()))
            .unwrap();
        let scope = ScopeHandle::for_method(&stub);
        assert!(scope.is_dynamic_scope());
        assert_eq!(scope.module_of(), ModuleId(9));
        assert_eq!(scope.dynamic_method(), Some(stub.slot()));
        assert_eq!(scope.requires_access_check(), Ok(false));
        assert_ne!(scope, bare_scope);
    }
}
