use std::{cell::RefCell, collections::BTreeSet, fmt, rc::Rc};

use tracing::{debug, debug_span, error, info, trace, warn};

use super::{
    association::{Association, Associations},
    registry::{Method, MethodWithArgument, ParallelClass, Registry},
    status::{self, StatusReport},
    wire::{Command, Payload, Reply},
};
use crate::{
    config::PmiConfig, error::Failure, transport::Transport, ClassId, Error, MethodId, ObjectId,
    CONTROLLER, NOT_ASSOCIATED,
};

/// Counters of what the controller has put on the wire.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ProtocolStats {
    /// Commands broadcast, `Stop` included.
    pub commands: u64,
    pub class_associations: u64,
    pub method_associations: u64,
    pub objects_created: u64,
    pub objects_destroyed: u64,
}

struct Session {
    transport: Box<dyn Transport>,
    registry: Registry,
    config: PmiConfig,
    associations: Associations,
    next_object_id: ObjectId,
    live: BTreeSet<ObjectId>,
    workers_active: bool,
    aborted: Option<String>,
    stats: ProtocolStats,
}

impl Session {
    /// Runs one controller operation. A fatal error poisons the session.
    fn run<R>(&mut self, op: impl FnOnce(&mut Session) -> Result<R, Error>) -> Result<R, Error> {
        let span = debug_span!("controller");
        let _guard = span.enter();
        self.ensure_active()?;
        op(self).map_err(|e| {
            if e.is_fatal() {
                self.abort(&e);
            }
            e
        })
    }

    fn ensure_active(&self) -> Result<(), Error> {
        if let Some(reason) = &self.aborted {
            return Err(Error::Aborted(reason.clone()));
        }
        if !self.workers_active {
            return Err(Error::WorkersTerminated);
        }
        Ok(())
    }

    /// Releases whatever workers can still be reached and refuses every
    /// later operation.
    fn abort(&mut self, reason: &Error) {
        if self.aborted.is_some() {
            return;
        }
        error!("aborting the run: {}", reason);
        if self.workers_active {
            self.workers_active = false;
            let stop = Command::Stop.encode();
            if let Err(e) = stop.and_then(|frame| self.transport.broadcast(&frame)) {
                warn!("could not stop every worker: {}", e);
            }
        }
        self.aborted = Some(reason.to_string());
    }

    fn broadcast(&mut self, command: &Command) -> Result<(), Error> {
        trace!("broadcasting {:?}", command);
        let frame = command.encode()?;
        self.transport.broadcast(&frame)?;
        self.stats.commands += 1;
        Ok(())
    }

    /// Collects the workers' replies to `command`, if it has any, and folds
    /// them together with the controller's own outcome. Returns the reply
    /// payloads in rank order, starting at rank 1.
    fn collect(
        &mut self,
        command: &Command,
        own: Result<(), Failure>,
    ) -> Result<Vec<Vec<u8>>, Error> {
        if !command.expects_reply(self.config.status_channel) {
            own.map_err(|failure| Error::from_failure(CONTROLLER, failure))?;
            return Ok(Vec::new());
        }

        let frames = self.transport.gather_root()?;
        let replies = frames
            .iter()
            .map(|frame| Reply::from_payload(frame))
            .collect::<Result<Vec<_>, _>>()?;
        trace!("gathered {} replies", replies.len());

        let reports = std::iter::once((CONTROLLER, StatusReport::from(&own))).chain(
            replies
                .iter()
                .enumerate()
                .map(|(i, reply)| (i + 1, reply.status.clone())),
        );
        status::evaluate(reports)?;
        Ok(replies.into_iter().map(|reply| reply.payload).collect())
    }

    fn associate_class(&mut self, name: &'static str) -> Result<ClassId, Error> {
        if !self.registry.contains_class(name) {
            return Err(Error::NotRegistered {
                rank: CONTROLLER,
                name: name.to_owned(),
            });
        }
        let association = self
            .associations
            .associate_class(name)
            .ok_or_else(|| exhausted("class"))?;
        let Association::Fresh(id) = association else {
            return Ok(association.id());
        };

        info!("associating class \"{}\" to class id {}", name, id);
        let command = Command::AssociateClass {
            name: name.to_owned(),
            id,
        };
        self.broadcast(&command)?;
        self.stats.class_associations += 1;
        self.collect(&command, Ok(()))?;
        Ok(id)
    }

    fn associate_method(&mut self, name: &'static str, gather: bool) -> Result<MethodId, Error> {
        let Some(invocable) = self.registry.method(name) else {
            return Err(Error::NotRegistered {
                rank: CONTROLLER,
                name: name.to_owned(),
            });
        };
        if gather && !invocable.gathers() {
            return Err(Error::Internal {
                rank: CONTROLLER,
                message: format!("method \"{name}\" was not registered as a gathering method"),
            });
        }
        let association = self
            .associations
            .associate_method(name)
            .ok_or_else(|| exhausted("method"))?;
        let Association::Fresh(id) = association else {
            return Ok(association.id());
        };

        info!("associating method \"{}\" to method id {}", name, id);
        let command = Command::AssociateMethod {
            name: name.to_owned(),
            id,
        };
        self.broadcast(&command)?;
        self.stats.method_associations += 1;
        self.collect(&command, Ok(()))?;
        Ok(id)
    }

    fn destroy(&mut self, class_id: ClassId, object_id: ObjectId) -> Result<(), Error> {
        if self.aborted.is_none() && !self.workers_active {
            debug!("workers are stopped, destroying object {} locally", object_id);
            self.live.remove(&object_id);
            return Ok(());
        }
        self.run(|session| {
            debug!("destroying object {} of class id {}", object_id, class_id);
            let command = Command::Destroy {
                class_id,
                object_id,
            };
            session.broadcast(&command)?;
            session.live.remove(&object_id);
            session.stats.objects_destroyed += 1;
            session.collect(&command, Ok(()))?;
            Ok(())
        })
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        if self.workers_active {
            info!("controller released without end_all, stopping the workers");
            self.workers_active = false;
            let stop = Command::Stop.encode();
            if let Err(e) = stop.and_then(|frame| self.transport.broadcast(&frame)) {
                warn!("could not stop every worker: {}", e);
            }
        }
    }
}

fn exhausted(kind: &str) -> Error {
    Error::Internal {
        rank: CONTROLLER,
        message: format!("{kind} id space is exhausted"),
    }
}

/// The controller's side of a run: creates parallel objects and finally
/// releases the workers.
///
/// Operations are strictly sequential; every one of them completes on all
/// ranks before the next starts. If an operation fails fatally, the workers
/// are stopped and every later operation returns [`Error::Aborted`].
pub struct Controller {
    session: Rc<RefCell<Session>>,
}

impl Controller {
    pub(crate) fn new(transport: Box<dyn Transport>, registry: Registry, config: PmiConfig) -> Self {
        let session = Session {
            transport,
            registry,
            config,
            associations: Associations::new(),
            next_object_id: 0,
            live: BTreeSet::new(),
            workers_active: true,
            aborted: None,
            stats: ProtocolStats::default(),
        };
        Controller {
            session: Rc::new(RefCell::new(session)),
        }
    }

    /// Number of ranks, controller included.
    pub fn size(&self) -> usize {
        self.session.borrow().transport.size()
    }

    /// Mirrors `local` on every worker. Workers build their instance with
    /// the factory they registered for `T`; state they need beyond that is
    /// pushed with [`ParallelObject::invoke_with_argument`].
    pub fn create<T: ParallelClass>(&self, local: T) -> Result<ParallelObject<T>, Error> {
        let (class_id, object_id) = self.session.borrow_mut().run(|session| {
            let class_id = session.associate_class(T::NAME)?;
            let object_id = session.next_object_id;
            if object_id == NOT_ASSOCIATED {
                return Err(exhausted("object"));
            }
            session.next_object_id += 1;

            info!(
                "creating object {} of class \"{}\" (class id {})",
                object_id,
                T::NAME,
                class_id
            );
            let command = Command::Create {
                class_id,
                object_id,
            };
            session.broadcast(&command)?;
            session.live.insert(object_id);
            session.stats.objects_created += 1;
            session.collect(&command, Ok(()))?;
            Ok((class_id, object_id))
        })?;

        Ok(ParallelObject {
            session: Rc::clone(&self.session),
            class_id,
            object_id,
            local,
            released: false,
        })
    }

    pub fn create_default<T: ParallelClass + Default>(&self) -> Result<ParallelObject<T>, Error> {
        self.create(T::default())
    }

    /// Releases the workers from their dispatch loop. Afterwards objects can
    /// only be destroyed locally and everything else fails with
    /// [`Error::WorkersTerminated`].
    pub fn end_all(&self) -> Result<(), Error> {
        self.session.borrow_mut().run(|session| {
            info!("stopping {} workers", session.transport.size().saturating_sub(1));
            session.workers_active = false;
            session.broadcast(&Command::Stop)
        })
    }

    /// Makes every rank log its object table. Returns the live object ids of
    /// each rank, indexed by rank.
    pub fn dump(&self) -> Result<Vec<Vec<ObjectId>>, Error> {
        self.session.borrow_mut().run(|session| {
            let own: Vec<ObjectId> = session.live.iter().copied().collect();
            info!("{} live objects: {:?}", own.len(), own);
            let command = Command::Dump;
            session.broadcast(&command)?;
            let payloads = session.collect(&command, Ok(()))?;

            let mut tables = Vec::with_capacity(payloads.len() + 1);
            tables.push(own);
            for payload in payloads {
                tables.push(Vec::<ObjectId>::from_payload(&payload)?);
            }
            Ok(tables)
        })
    }

    pub fn stats(&self) -> ProtocolStats {
        self.session.borrow().stats
    }

    pub fn is_workers_active(&self) -> bool {
        self.session.borrow().workers_active
    }

    /// The reason the run was aborted, if it was.
    pub fn abort_reason(&self) -> Option<String> {
        self.session.borrow().aborted.clone()
    }

    pub fn class_id(&self, name: &str) -> Option<ClassId> {
        self.session.borrow().associations.class_id(name)
    }

    pub fn method_id(&self, name: &str) -> Option<MethodId> {
        self.session.borrow().associations.method_id(name)
    }

    /// Ids of the objects the controller currently holds, ascending.
    pub fn live_objects(&self) -> Vec<ObjectId> {
        self.session.borrow().live.iter().copied().collect()
    }
}

impl fmt::Debug for Controller {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let session = self.session.borrow();
        f.debug_struct("Controller")
            .field("size", &session.transport.size())
            .field("workers_active", &session.workers_active)
            .field("live", &session.live)
            .field("stats", &session.stats)
            .finish()
    }
}

/// Handle to one object mirrored on every rank.
///
/// Dropping the handle destroys the object everywhere; [`destroy`] does the
/// same but reports failures.
///
/// [`destroy`]: ParallelObject::destroy
pub struct ParallelObject<T: ParallelClass> {
    session: Rc<RefCell<Session>>,
    class_id: ClassId,
    object_id: ObjectId,
    local: T,
    released: bool,
}

impl<T: ParallelClass> ParallelObject<T> {
    pub fn id(&self) -> ObjectId {
        self.object_id
    }

    pub fn class_id(&self) -> ClassId {
        self.class_id
    }

    /// The controller's own instance.
    pub fn local(&self) -> &T {
        &self.local
    }

    /// Changes made here are not replayed on the workers.
    pub fn local_mut(&mut self) -> &mut T {
        &mut self.local
    }

    /// Calls `M` on every rank and returns the controller's result.
    pub fn invoke<M: Method<Class = T>>(&mut self) -> Result<M::Output, Error> {
        let ParallelObject {
            session,
            class_id,
            object_id,
            local,
            ..
        } = self;
        session.borrow_mut().run(|session| {
            let method_id = session.associate_method(M::NAME, false)?;
            debug!("invoking \"{}\" on object {}", M::NAME, object_id);
            let command = Command::Invoke {
                class_id: *class_id,
                method_id,
                object_id: *object_id,
                argument: Vec::new(),
            };
            session.broadcast(&command)?;
            let output = M::call(local);
            session.collect(&command, own_outcome(&output))?;
            output.map_err(|e| user_error(e.message()))
        })
    }

    /// Calls `M` with `argument` on every rank. The argument travels in the
    /// same frame as the invocation.
    pub fn invoke_with_argument<M>(&mut self, argument: M::Argument) -> Result<M::Output, Error>
    where
        M: MethodWithArgument<Class = T>,
    {
        let ParallelObject {
            session,
            class_id,
            object_id,
            local,
            ..
        } = self;
        session.borrow_mut().run(|session| {
            let encoded = argument.to_payload()?;
            let method_id = session.associate_method(M::NAME, false)?;
            debug!(
                "invoking \"{}\" on object {} with {} argument bytes",
                M::NAME,
                object_id,
                encoded.len()
            );
            let command = Command::Invoke {
                class_id: *class_id,
                method_id,
                object_id: *object_id,
                argument: encoded,
            };
            session.broadcast(&command)?;
            let output = M::call(local, argument);
            session.collect(&command, own_outcome(&output))?;
            output.map_err(|e| user_error(e.message()))
        })
    }

    /// Calls `M` on every rank and returns all results, indexed by rank.
    /// `M` must be registered as a gathering method.
    pub fn invoke_gather<M>(&mut self) -> Result<Vec<M::Output>, Error>
    where
        M: Method<Class = T>,
        M::Output: Payload,
    {
        let ParallelObject {
            session,
            class_id,
            object_id,
            local,
            ..
        } = self;
        session.borrow_mut().run(|session| {
            let method_id = session.associate_method(M::NAME, true)?;
            debug!("gathering \"{}\" from object {}", M::NAME, object_id);
            let command = Command::InvokeGather {
                class_id: *class_id,
                method_id,
                object_id: *object_id,
            };
            session.broadcast(&command)?;
            let output = M::call(local);
            let payloads = session.collect(&command, own_outcome(&output))?;

            let mut outputs = Vec::with_capacity(payloads.len() + 1);
            outputs.push(output.map_err(|e| user_error(e.message()))?);
            for payload in payloads {
                outputs.push(<M::Output as Payload>::from_payload(&payload)?);
            }
            Ok(outputs)
        })
    }

    /// Folds the results of [`invoke_gather`](Self::invoke_gather) with
    /// `op`, controller first.
    pub fn invoke_reduce<M, F>(&mut self, op: F) -> Result<M::Output, Error>
    where
        M: Method<Class = T>,
        M::Output: Payload,
        F: FnMut(M::Output, M::Output) -> M::Output,
    {
        let mut outputs = self.invoke_gather::<M>()?.into_iter();
        let first = outputs.next().ok_or_else(|| Error::Internal {
            rank: CONTROLLER,
            message: "gather returned no results".into(),
        })?;
        Ok(outputs.fold(first, op))
    }

    /// Destroys the object on every rank, the controller's instance last.
    pub fn destroy(mut self) -> Result<(), Error> {
        self.released = true;
        let result = self
            .session
            .borrow_mut()
            .destroy(self.class_id, self.object_id);
        result
    }
}

impl<T: ParallelClass> Drop for ParallelObject<T> {
    fn drop(&mut self) {
        if self.released {
            return;
        }
        let Ok(mut session) = self.session.try_borrow_mut() else {
            warn!("object {} dropped during another operation, not destroyed", self.object_id);
            return;
        };
        match session.destroy(self.class_id, self.object_id) {
            Ok(()) => {}
            Err(Error::Aborted(_)) => debug!("run aborted, object {} not destroyed", self.object_id),
            Err(e) => warn!("destroying object {} failed: {}", self.object_id, e),
        }
    }
}

impl<T: ParallelClass + fmt::Debug> fmt::Debug for ParallelObject<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ParallelObject")
            .field("class", &T::NAME)
            .field("class_id", &self.class_id)
            .field("object_id", &self.object_id)
            .field("local", &self.local)
            .finish()
    }
}

fn own_outcome<O>(output: &Result<O, crate::UserError>) -> Result<(), Failure> {
    match output {
        Ok(_) => Ok(()),
        Err(e) => Err(Failure::User(e.message().to_owned())),
    }
}

fn user_error(message: &str) -> Error {
    Error::User {
        rank: CONTROLLER,
        message: message.to_owned(),
    }
}
