// Copyright 2020 Palantir Technologies, Inc.
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
// http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.
use conjure_error::Error;

/// The tenant and principal on whose behalf a client is used.
///
/// `None` means the context is absent, which is distinct from an empty identifier.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default)]
pub struct IsolationScope {
    tenant: Option<String>,
    principal: Option<String>,
}

impl IsolationScope {
    /// Creates a scope with neither a tenant nor a principal.
    pub fn none() -> IsolationScope {
        IsolationScope::default()
    }

    /// Creates a scope for a tenant without a principal.
    pub fn tenant(tenant: impl Into<String>) -> IsolationScope {
        IsolationScope {
            tenant: Some(tenant.into()),
            principal: None,
        }
    }

    /// Creates a scope for a principal of a tenant.
    pub fn principal(tenant: impl Into<String>, principal: impl Into<String>) -> IsolationScope {
        IsolationScope {
            tenant: Some(tenant.into()),
            principal: Some(principal.into()),
        }
    }

    /// Creates a scope from optional parts.
    pub fn new(tenant: Option<String>, principal: Option<String>) -> IsolationScope {
        IsolationScope { tenant, principal }
    }

    /// Resolves the current scope from a context accessor.
    ///
    /// Absent context is not an error, but a failure to access the context is.
    pub fn from_accessor<A>(accessor: &A) -> Result<IsolationScope, Error>
    where
        A: ?Sized + ContextAccessor,
    {
        Ok(IsolationScope {
            tenant: accessor.current_tenant()?,
            principal: accessor.current_principal()?,
        })
    }

    /// Returns the tenant identifier.
    pub fn tenant_id(&self) -> Option<&str> {
        self.tenant.as_deref()
    }

    /// Returns the principal identifier.
    pub fn principal_id(&self) -> Option<&str> {
        self.principal.as_deref()
    }

    /// Returns a copy of this scope without the principal.
    pub fn without_principal(&self) -> IsolationScope {
        IsolationScope {
            tenant: self.tenant.clone(),
            principal: None,
        }
    }
}

/// Access to the tenant and principal of the current request context.
pub trait ContextAccessor {
    /// Returns the current tenant, or `None` if no tenant is in context.
    fn current_tenant(&self) -> Result<Option<String>, Error>;

    /// Returns the current principal, or `None` if no principal is in context.
    fn current_principal(&self) -> Result<Option<String>, Error>;
}

impl ContextAccessor for IsolationScope {
    fn current_tenant(&self) -> Result<Option<String>, Error> {
        Ok(self.tenant.clone())
    }

    fn current_principal(&self) -> Result<Option<String>, Error> {
        Ok(self.principal.clone())
    }
}
