use kube::{ResourceExt, api::DynamicObject};
use nodepool_ingress_templates::{Template, TemplateParams};
use tokio::time::{Duration, sleep};

use crate::{
    errors::{AddonError, ExtKubeApiError},
    scope::PoolScope,
    store::{DeleteOptions, ObjectStore},
    utils::{Overrides, add_labels, display_name},
};

/// What to do with the object rendered from a step's template.
#[derive(Clone, Debug, PartialEq)]
pub(crate) enum Action {
    /// Render, apply the overrides and create.
    Create(Overrides),
    /// Delete the existing object, an absent object counts as deleted.
    Delete(DeleteOptions),
    /// Apply the overrides to the existing object, which must exist.
    Update(Overrides),
    /// Pause for `settle`, then wait up to `timeout` for the object to disappear.
    AwaitAbsent { settle: Duration, timeout: Duration },
}

#[derive(Clone, Debug, PartialEq)]
pub(crate) struct Step {
    pub template: Template,
    pub action: Action,
}

impl Step {
    pub(crate) fn create(template: Template, overrides: Overrides) -> Self {
        Self {
            template,
            action: Action::Create(overrides),
        }
    }

    pub(crate) fn delete(template: Template, options: DeleteOptions) -> Self {
        Self {
            template,
            action: Action::Delete(options),
        }
    }

    pub(crate) fn update(template: Template, overrides: Overrides) -> Self {
        Self {
            template,
            action: Action::Update(overrides),
        }
    }

    pub(crate) fn await_absent(template: Template, settle: Duration, timeout: Duration) -> Self {
        Self {
            template,
            action: Action::AwaitAbsent { settle, timeout },
        }
    }
}

impl std::fmt::Display for Step {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let verb = match &self.action {
            Action::Create(_) => "create",
            Action::Delete(_) => "delete",
            Action::Update(_) => "update",
            Action::AwaitAbsent { .. } => "await deletion of",
        };
        write!(f, "{} {} {}", verb, self.template.kind(), self.template)
    }
}

/// Ordered list of steps, either for the cluster-shared objects (no scope) or
/// for the objects of one node pool.
#[derive(Clone, Debug)]
pub(crate) struct Sequence {
    pub name: &'static str,
    pub scope: Option<PoolScope>,
    pub steps: Vec<Step>,
}

/// Outcome of a successful [`Sequence`] run.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub(crate) struct Progress {
    pub steps: usize,
    pub created: usize,
    /// Objects which already existed when they were about to be created.
    pub adopted: usize,
    pub updated: usize,
    pub deleted: usize,
    /// Objects which were already gone when they were about to be deleted.
    pub absent: usize,
}

impl std::fmt::Display for Progress {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{} steps: {} created, {} adopted, {} updated, {} deleted, {} already absent",
            self.steps, self.created, self.adopted, self.updated, self.deleted, self.absent
        )
    }
}

/// Executes [`Sequence`]s against an [`ObjectStore`].
///
/// Steps run strictly in order. The first failing step stops the run, nothing is
/// retried and steps completed before are not rolled back; the returned
/// [`AddonError::Sequence`] tells how many steps completed.
pub(crate) struct SequenceRunner<'a, S: ObjectStore + ?Sized> {
    store: &'a S,
    /// Treat `AlreadyExists` on create as success.
    adopt_existing: bool,
}

impl<'a, S: ObjectStore + ?Sized> SequenceRunner<'a, S> {
    pub(crate) fn new(store: &'a S, adopt_existing: bool) -> Self {
        Self {
            store,
            adopt_existing,
        }
    }

    pub(crate) async fn run(&self, sequence: &Sequence) -> Result<Progress, AddonError> {
        let mut progress = Progress::default();
        let target = match &sequence.scope {
            Some(scope) => format!(" for {}", scope),
            None => String::new(),
        };
        for (index, step) in sequence.steps.iter().enumerate() {
            if let Err(e) = self
                .run_step(sequence.scope.as_ref(), step, &mut progress)
                .await
            {
                error!(
                    "{}{} failed at step {} ({}): {}",
                    sequence.name, target, index, step, e
                );
                return Err(AddonError::Sequence {
                    completed: index,
                    step: step.to_string(),
                    source: Box::new(e),
                });
            }
            progress.steps += 1;
        }
        info!("{}{} finished, {}", sequence.name, target, progress);
        Ok(progress)
    }

    fn render(&self, scope: Option<&PoolScope>, template: Template) -> Result<DynamicObject, AddonError> {
        let params = scope.map(|s| s.params()).unwrap_or_else(TemplateParams::new);
        let mut obj = template.render(&params)?;
        if let Some(scope) = scope {
            add_labels(&mut obj, &scope.labels());
        }
        Ok(obj)
    }

    /// Find the existing object of a template. Pool objects are looked up through
    /// the scope's selector, so an object of the same name not carrying the
    /// scope label is never returned.
    async fn locate(
        &self,
        scope: Option<&PoolScope>,
        rendered: &DynamicObject,
        template: Template,
    ) -> Result<Option<DynamicObject>, AddonError> {
        let kind = template.kind();
        let namespace = rendered.namespace();
        let name = rendered.name_any();
        match scope {
            Some(scope) => {
                let found = self
                    .store
                    .list(kind, namespace.as_deref(), scope.selector().as_str())
                    .await?;
                Ok(found
                    .into_iter()
                    .find(|o| o.name_any() == name && scope.matches(o)))
            }
            None => match self.store.get(kind, namespace.as_deref(), name.as_str()).await {
                Ok(obj) => Ok(Some(obj)),
                Err(e) if e.is_not_found() => Ok(None),
                Err(e) => Err(e.into()),
            },
        }
    }

    async fn run_step(
        &self,
        scope: Option<&PoolScope>,
        step: &Step,
        progress: &mut Progress,
    ) -> Result<(), AddonError> {
        let kind = step.template.kind();
        let mut obj = self.render(scope, step.template)?;
        match &step.action {
            Action::Create(overrides) => {
                overrides.apply(&mut obj)?;
                match self.store.create(kind, &obj).await {
                    Ok(_) => {
                        debug!("created {}", display_name(&obj));
                        progress.created += 1;
                    }
                    Err(e) if e.is_already_exists() && self.adopt_existing => {
                        debug!("{} already exists", display_name(&obj));
                        progress.adopted += 1;
                    }
                    Err(e) if e.is_already_exists() => {
                        return Err(AddonError::AlreadyExists(format!(
                            "{} already exists: {}",
                            display_name(&obj),
                            e
                        )));
                    }
                    Err(e) => Err(e)?,
                }
            }
            Action::Delete(options) => match self.locate(scope, &obj, step.template).await? {
                Some(existing) => {
                    let namespace = existing.namespace();
                    let name = existing.name_any();
                    match self
                        .store
                        .delete(kind, namespace.as_deref(), name.as_str(), *options)
                        .await
                    {
                        Ok(_) => {
                            debug!("deleted {}", display_name(&obj));
                            progress.deleted += 1;
                        }
                        Err(e) if e.is_not_found() => {
                            debug!(
                                "tried to delete {}, but it does no longer exist",
                                display_name(&obj)
                            );
                            progress.absent += 1;
                        }
                        Err(e) => Err(e)?,
                    }
                }
                None => {
                    debug!("{} does not exist, nothing to delete", display_name(&obj));
                    progress.absent += 1;
                }
            },
            Action::Update(overrides) => {
                let mut existing = self
                    .locate(scope, &obj, step.template)
                    .await?
                    .ok_or_else(|| {
                        AddonError::LookupFailure(format!(
                            "{} does not exist",
                            display_name(&obj)
                        ))
                    })?;
                overrides.apply(&mut existing)?;
                self.store.update(kind, &existing).await?;
                debug!("updated {}", display_name(&obj));
                progress.updated += 1;
            }
            Action::AwaitAbsent { settle, timeout } => {
                if !settle.is_zero() {
                    sleep(*settle).await;
                }
                let namespace = obj.namespace();
                let name = obj.name_any();
                if !self
                    .store
                    .wait_absent(kind, namespace.as_deref(), name.as_str(), *timeout)
                    .await?
                {
                    return Err(AddonError::RecreateTimeout(format!(
                        "{} still exists after {:?}",
                        display_name(&obj),
                        *settle + *timeout
                    )));
                }
            }
        }
        Ok(())
    }
}
