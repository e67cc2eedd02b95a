//! Fixture resolution: walking a unit's required fixtures, recursively
//! materializing their dependency graphs through the scope store.
//!
//! The resolver works against the instance chain of the requesting unit:
//! function → class → module → session. A fixture is invoked only when no
//! instance on the chain already holds its key; the result is stored under
//! the instance matching the fixture's declared scope.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;

use futures::future::LocalBoxFuture;
use futures::FutureExt;

use crate::error::{panic_message, FixtureError};
use crate::model::{
    FixtureArgs, FixtureDef, FixtureFactory, FixtureOutput, FixtureValue, TestCase, TestContext,
    CONTEXT_PARAM,
};
use crate::registry::FixtureRegistry;
use crate::store::{ScopeId, ScopeStore};

/// Resolves one unit's argument set against a registry and a shared scope
/// store. Cheap to construct; one per unit of work.
pub struct FixtureResolver<'a> {
    registry: &'a FixtureRegistry,
    store: &'a mut ScopeStore,
    unit: &'a TestCase,
    /// Names currently being resolved, for cycle detection.
    stack: Vec<String>,
    /// Case value of the parametrized fixture currently being resolved,
    /// surfaced through the reserved `context` parameter.
    current_param: Option<FixtureValue>,
}

impl<'a> FixtureResolver<'a> {
    pub fn new(registry: &'a FixtureRegistry, store: &'a mut ScopeStore, unit: &'a TestCase) -> Self {
        Self {
            registry,
            store,
            unit,
            stack: Vec::new(),
            current_param: None,
        }
    }

    /// Materialize the unit's full argument set without an event loop.
    ///
    /// Reaching an async fixture on this path is an error; the scheduling
    /// classifier routes units with async dependencies through
    /// [`Self::resolve_all_async`] instead.
    pub fn resolve_all_sync(&mut self) -> Result<FixtureArgs, FixtureError> {
        let unit = self.unit;
        for name in self.autouse_names() {
            self.resolve_name_sync(&name)?;
        }
        for name in unit.extra_fixtures.clone() {
            self.resolve_name_sync(&name)?;
        }
        let mut args = FixtureArgs::new();
        for dep in unit.dependencies.clone() {
            let value = self.resolve_name_sync(&dep)?;
            args.insert(dep, value);
        }
        Ok(args)
    }

    /// Materialize the unit's full argument set, awaiting async fixtures in
    /// dependency order. The caller drives the returned future on the loop
    /// owned by the unit's effective loop scope.
    pub async fn resolve_all_async(&mut self) -> Result<FixtureArgs, FixtureError> {
        let unit = self.unit;
        for name in self.autouse_names() {
            self.resolve_name_async(name).await?;
        }
        for name in unit.extra_fixtures.clone() {
            self.resolve_name_async(name).await?;
        }
        let mut args = FixtureArgs::new();
        for dep in unit.dependencies.clone() {
            let value = self.resolve_name_async(dep.clone()).await?;
            args.insert(dep, value);
        }
        Ok(args)
    }

    fn autouse_names(&self) -> Vec<String> {
        self.registry
            .autouse_for(&self.unit.location())
            .into_iter()
            .map(str::to_string)
            .collect()
    }

    /// The unit's instance chain, innermost first.
    fn chain(&self) -> Vec<ScopeId> {
        let mut chain = vec![ScopeId::Function(self.unit.id.clone())];
        if let Some(class) = &self.unit.class {
            chain.push(ScopeId::Class {
                module: self.unit.module.clone(),
                class: class.clone(),
            });
        }
        chain.push(ScopeId::Module(self.unit.module.clone()));
        chain.push(ScopeId::Session);
        chain
    }

    /// Memoization key for a definition, including the parametrized case
    /// index when one applies, plus the case value itself.
    fn cache_key(&self, def: &FixtureDef) -> Result<(String, Option<FixtureValue>), FixtureError> {
        let Some(params) = &def.params else {
            return Ok((def.name.clone(), None));
        };
        let index = self
            .unit
            .fixture_param_indices
            .get(&def.name)
            .copied()
            .unwrap_or(0);
        let case = params
            .get(index)
            .ok_or_else(|| FixtureError::MissingParamCase {
                name: def.name.clone(),
                index,
            })?;
        Ok((format!("{}[{}]", def.name, index), Some(case.clone())))
    }

    fn context_value(&self) -> FixtureValue {
        Arc::new(TestContext {
            unit_id: self.unit.id.clone(),
            param: self.current_param.clone(),
        })
    }

    /// Shared pre-invocation steps: direct parameters, the reserved context
    /// name, memo lookup, cycle detection, and scope validation. Returns
    /// `Ok(Ok(value))` when no invocation is needed.
    #[allow(clippy::type_complexity)]
    fn prepare(
        &mut self,
        name: &str,
    ) -> Result<Result<FixtureValue, (&'a FixtureDef, String, Option<FixtureValue>)>, FixtureError>
    {
        if let Some(value) = self.unit.params.get(name) {
            return Ok(Ok(value.clone()));
        }
        if name == CONTEXT_PARAM {
            return Ok(Ok(self.context_value()));
        }

        let registry = self.registry;
        let def = registry.lookup(name, &self.unit.location())?;
        let (key, case_param) = self.cache_key(def)?;
        if let Some(value) = self.store.lookup_chain(&self.chain(), &key) {
            return Ok(Ok(value));
        }

        if self.stack.iter().any(|entry| entry == name) {
            let mut cycle = self.stack.join(" -> ");
            cycle.push_str(" -> ");
            cycle.push_str(name);
            return Err(FixtureError::Cycle { cycle });
        }

        // A fixture may only depend on fixtures of equal or wider scope.
        for dep in &def.dependencies {
            if dep == CONTEXT_PARAM || self.unit.params.contains_key(dep) {
                continue;
            }
            if let Some(dep_def) = registry.get_visible(dep, &self.unit.location()) {
                if def.scope.is_wider_than(dep_def.scope) {
                    return Err(FixtureError::ScopeMismatch {
                        fixture: def.name.clone(),
                        fixture_scope: def.scope,
                        dependency: dep_def.name.clone(),
                        dependency_scope: dep_def.scope,
                    });
                }
            }
        }

        Ok(Err((def, key, case_param)))
    }

    /// Store a freshly produced output and hand back its value.
    fn commit(&mut self, def: &FixtureDef, key: String, output: FixtureOutput) -> FixtureValue {
        let scope = ScopeId::for_unit(def.scope, self.unit);
        let value = output.value;
        self.store.insert(scope.clone(), key, value.clone());
        if let Some(teardown) = output.teardown {
            self.store.push_teardown(scope, def.name.clone(), teardown);
        }
        value
    }

    pub fn resolve_name_sync(&mut self, name: &str) -> Result<FixtureValue, FixtureError> {
        let (def, key, case_param) = match self.prepare(name)? {
            Ok(value) => return Ok(value),
            Err(pending) => pending,
        };

        self.stack.push(def.name.clone());
        let previous = self.current_param.take();
        self.current_param = case_param;

        let produced = (|| {
            let mut args = FixtureArgs::new();
            for dep in &def.dependencies {
                let value = self.resolve_name_sync(dep)?;
                args.insert(dep.clone(), value);
            }
            invoke_sync(def, args)
        })();

        self.stack.pop();
        self.current_param = previous;
        let output = produced?;
        Ok(self.commit(def, key, output))
    }

    pub fn resolve_name_async(
        &mut self,
        name: String,
    ) -> LocalBoxFuture<'_, Result<FixtureValue, FixtureError>> {
        async move {
            let (def, key, case_param) = match self.prepare(&name)? {
                Ok(value) => return Ok(value),
                Err(pending) => pending,
            };

            self.stack.push(def.name.clone());
            let previous = self.current_param.take();
            self.current_param = case_param;

            let mut produced: Result<FixtureArgs, FixtureError> = Ok(FixtureArgs::new());
            for dep in def.dependencies.clone() {
                match self.resolve_name_async(dep.clone()).await {
                    Ok(value) => {
                        if let Ok(args) = produced.as_mut() {
                            args.insert(dep, value);
                        }
                    }
                    Err(err) => {
                        produced = Err(err);
                        break;
                    }
                }
            }
            let output = match produced {
                Ok(args) => invoke_async(def, args).await,
                Err(err) => Err(err),
            };

            self.stack.pop();
            self.current_param = previous;
            let output = output?;
            Ok(self.commit(def, key, output))
        }
        .boxed_local()
    }
}

/// Attribute a factory error to its fixture unless it already carries the
/// attribution (or is a skip, which must propagate untouched).
fn attribute(def: &FixtureDef, err: FixtureError) -> FixtureError {
    match err {
        FixtureError::Skipped(_) | FixtureError::Setup { .. } => err,
        other => FixtureError::Setup {
            name: def.name.clone(),
            message: other.to_string(),
        },
    }
}

fn invoke_sync(def: &FixtureDef, args: FixtureArgs) -> Result<FixtureOutput, FixtureError> {
    match &def.factory {
        FixtureFactory::Sync(factory) => {
            match catch_unwind(AssertUnwindSafe(|| factory(args))) {
                Ok(result) => result.map_err(|err| attribute(def, err)),
                Err(payload) => Err(FixtureError::Setup {
                    name: def.name.clone(),
                    message: panic_message(payload),
                }),
            }
        }
        FixtureFactory::Async(_) => Err(FixtureError::AsyncInSyncContext(def.name.clone())),
    }
}

async fn invoke_async(def: &FixtureDef, args: FixtureArgs) -> Result<FixtureOutput, FixtureError> {
    match &def.factory {
        FixtureFactory::Sync(factory) => {
            match catch_unwind(AssertUnwindSafe(|| factory(args))) {
                Ok(result) => result.map_err(|err| attribute(def, err)),
                Err(payload) => Err(FixtureError::Setup {
                    name: def.name.clone(),
                    message: panic_message(payload),
                }),
            }
        }
        FixtureFactory::Async(factory) => {
            let fut = factory(args);
            match AssertUnwindSafe(fut).catch_unwind().await {
                Ok(result) => result.map_err(|err| attribute(def, err)),
                Err(payload) => Err(FixtureError::Setup {
                    name: def.name.clone(),
                    message: panic_message(payload),
                }),
            }
        }
    }
}
