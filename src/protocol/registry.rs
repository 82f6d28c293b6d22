use std::{any::Any, marker::PhantomData};

use hashbrown::HashMap;
use tracing::{trace, warn};

use super::wire::Payload;
use crate::error::{Failure, UserError};

/// A class whose instances can be mirrored on every rank.
///
/// `NAME` must be identical in every process of the run; by convention it is
/// `"Namespace::Class"`.
pub trait ParallelClass: Any {
    const NAME: &'static str;
}

/// A zero-argument method of a [`ParallelClass`], named by a marker type.
/// Usually declared through [`parallel_method!`](crate::parallel_method).
pub trait Method: 'static {
    type Class: ParallelClass;
    type Output;
    /// `"Namespace::Class::method()"`.
    const NAME: &'static str;

    fn call(target: &mut Self::Class) -> Result<Self::Output, UserError>;
}

/// A method taking one typed argument. The controller archives the argument
/// into the `Invoke` frame, so it reaches every rank in the same collective.
pub trait MethodWithArgument: 'static {
    type Class: ParallelClass;
    type Argument: Payload;
    type Output;
    const NAME: &'static str;

    fn call(target: &mut Self::Class, argument: Self::Argument) -> Result<Self::Output, UserError>;
}

/// Lets registered methods return either a plain value or a
/// `Result<_, UserError>`.
pub trait IntoOutcome {
    type Output;

    fn into_outcome(self) -> Result<Self::Output, UserError>;
}

impl IntoOutcome for () {
    type Output = ();

    fn into_outcome(self) -> Result<(), UserError> {
        Ok(())
    }
}

impl<T> IntoOutcome for Result<T, UserError> {
    type Output = T;

    fn into_outcome(self) -> Result<T, UserError> {
        self
    }
}

impl<T> IntoOutcome for Vec<T> {
    type Output = Vec<T>;

    fn into_outcome(self) -> Result<Vec<T>, UserError> {
        Ok(self)
    }
}

macro_rules! plain_outcome {
    ($($ty:ty),*) => {
        $(
            impl IntoOutcome for $ty {
                type Output = $ty;

                fn into_outcome(self) -> Result<$ty, UserError> {
                    Ok(self)
                }
            }
        )*
    };
}

plain_outcome!(bool, u8, u16, u32, u64, usize, i8, i16, i32, i64, isize, f32, f64, String);

/// Type-erased entry point of a registered method, as stored in the
/// [`Registry`] and called by the worker loop.
pub trait Invocable {
    /// Name of the class this method belongs to.
    fn class_name(&self) -> &'static str;

    /// Whether the output is archived and sent back on `InvokeGather`.
    fn gathers(&self) -> bool {
        false
    }

    fn invoke(&self, target: &mut dyn Any, argument: &[u8]) -> Result<Option<Vec<u8>>, Failure>;
}

fn downcast<T: ParallelClass>(target: &mut dyn Any) -> Result<&mut T, Failure> {
    target.downcast_mut::<T>().ok_or_else(|| {
        Failure::Internal(format!("object is not an instance of \"{}\"", T::NAME))
    })
}

fn no_argument(method: &str, argument: &[u8]) -> Result<(), Failure> {
    if argument.is_empty() {
        Ok(())
    } else {
        Err(Failure::Internal(format!(
            "method \"{method}\" takes no argument, received {} bytes",
            argument.len()
        )))
    }
}

pub struct PlainCall<M>(PhantomData<fn() -> M>);

impl<M: Method> Invocable for PlainCall<M> {
    fn class_name(&self) -> &'static str {
        <M::Class as ParallelClass>::NAME
    }

    fn invoke(&self, target: &mut dyn Any, argument: &[u8]) -> Result<Option<Vec<u8>>, Failure> {
        no_argument(M::NAME, argument)?;
        M::call(downcast::<M::Class>(target)?)?;
        Ok(None)
    }
}

pub struct GatheringCall<M>(PhantomData<fn() -> M>);

impl<M> Invocable for GatheringCall<M>
where
    M: Method,
    M::Output: Payload,
{
    fn class_name(&self) -> &'static str {
        <M::Class as ParallelClass>::NAME
    }

    fn gathers(&self) -> bool {
        true
    }

    fn invoke(&self, target: &mut dyn Any, argument: &[u8]) -> Result<Option<Vec<u8>>, Failure> {
        no_argument(M::NAME, argument)?;
        let output = M::call(downcast::<M::Class>(target)?)?;
        let bytes = output.to_payload().map_err(|e| {
            Failure::Internal(format!("output of \"{}\": {}", M::NAME, e))
        })?;
        Ok(Some(bytes))
    }
}

pub struct ArgumentCall<M>(PhantomData<fn() -> M>);

impl<M: MethodWithArgument> Invocable for ArgumentCall<M> {
    fn class_name(&self) -> &'static str {
        <M::Class as ParallelClass>::NAME
    }

    fn invoke(&self, target: &mut dyn Any, argument: &[u8]) -> Result<Option<Vec<u8>>, Failure> {
        let argument = M::Argument::from_payload(argument).map_err(|e| {
            Failure::Internal(format!("argument of \"{}\": {}", M::NAME, e))
        })?;
        M::call(downcast::<M::Class>(target)?, argument)?;
        Ok(None)
    }
}

type Factory = Box<dyn Fn() -> Box<dyn Any>>;

/// Process-local table of constructible classes and callable methods.
///
/// Every rank builds its registry with the same registrations before calling
/// [`main_entry`](crate::main_entry). Registration never communicates.
#[derive(Default)]
pub struct Registry {
    classes: HashMap<&'static str, Factory>,
    methods: HashMap<&'static str, Box<dyn Invocable>>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `T`, constructed with `Default` on the workers.
    pub fn register_class<T: ParallelClass + Default>(&mut self) -> &mut Self {
        self.register_class_with(T::default)
    }

    /// Registers `T` with an explicit worker-side factory.
    pub fn register_class_with<T, F>(&mut self, make: F) -> &mut Self
    where
        T: ParallelClass,
        F: Fn() -> T + 'static,
    {
        let factory: Factory = Box::new(move || -> Box<dyn Any> { Box::new(make()) });
        if self.classes.insert(T::NAME, factory).is_some() {
            warn!("class \"{}\" registered twice, keeping the last factory", T::NAME);
        }
        trace!("registered class \"{}\"", T::NAME);
        self
    }

    pub fn register_method<M: Method>(&mut self) -> &mut Self {
        self.insert_method(M::NAME, Box::new(PlainCall::<M>(PhantomData)))
    }

    /// Registers `M` so that its output can be collected from every rank
    /// with `invoke_gather`. Such a method can also be invoked normally.
    pub fn register_gathering_method<M>(&mut self) -> &mut Self
    where
        M: Method,
        M::Output: Payload,
    {
        self.insert_method(M::NAME, Box::new(GatheringCall::<M>(PhantomData)))
    }

    pub fn register_method_with_argument<M: MethodWithArgument>(&mut self) -> &mut Self {
        self.insert_method(M::NAME, Box::new(ArgumentCall::<M>(PhantomData)))
    }

    fn insert_method(&mut self, name: &'static str, invocable: Box<dyn Invocable>) -> &mut Self {
        if self.methods.insert(name, invocable).is_some() {
            warn!("method \"{}\" registered twice, keeping the last caller", name);
        }
        trace!("registered method \"{}\"", name);
        self
    }

    pub fn contains_class(&self, name: &str) -> bool {
        self.classes.contains_key(name)
    }

    pub fn contains_method(&self, name: &str) -> bool {
        self.methods.contains_key(name)
    }

    /// Returns the registered spelling of `name`, which lives for the whole
    /// run.
    pub(crate) fn class_key(&self, name: &str) -> Option<&'static str> {
        self.classes.get_key_value(name).map(|(key, _)| *key)
    }

    pub(crate) fn method_key(&self, name: &str) -> Option<&'static str> {
        self.methods.get_key_value(name).map(|(key, _)| *key)
    }

    pub(crate) fn construct(&self, class: &str) -> Option<Box<dyn Any>> {
        self.classes.get(class).map(|factory| factory())
    }

    pub(crate) fn method(&self, name: &str) -> Option<&dyn Invocable> {
        self.methods.get(name).map(|invocable| invocable.as_ref())
    }

    pub fn class_names(&self) -> impl Iterator<Item = &'static str> + '_ {
        self.classes.keys().copied()
    }

    pub fn method_names(&self) -> impl Iterator<Item = &'static str> + '_ {
        self.methods.keys().copied()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::parallel_method;

    #[derive(Default)]
    struct Gauge {
        level: u64,
    }

    impl ParallelClass for Gauge {
        const NAME: &'static str = "Gauge";
    }

    impl Gauge {
        fn raise(&mut self) {
            self.level += 1;
        }

        fn level(&mut self) -> u64 {
            self.level
        }

        fn set_level(&mut self, level: u64) -> Result<(), UserError> {
            if level > 100 {
                return Err(UserError::new("bad value"));
            }
            self.level = level;
            Ok(())
        }
    }

    parallel_method!(Raise => Gauge::raise() -> ());
    parallel_method!(Level => Gauge::level() -> u64);
    parallel_method!(SetLevel => Gauge::set_level(u64) -> Result<(), UserError>);

    struct Other;

    impl ParallelClass for Other {
        const NAME: &'static str = "Other";
    }

    fn registry() -> Registry {
        let mut registry = Registry::new();
        registry
            .register_class::<Gauge>()
            .register_method::<Raise>()
            .register_gathering_method::<Level>()
            .register_method_with_argument::<SetLevel>();
        registry
    }

    #[test]
    fn method_names_follow_class_and_signature() {
        assert_eq!(Raise::NAME, "Gauge::raise()");
        assert_eq!(SetLevel::NAME, "Gauge::set_level(u64)");
    }

    #[test]
    fn lookup_by_name() {
        let registry = registry();
        assert!(registry.contains_class("Gauge"));
        assert!(!registry.contains_class("Other"));
        assert_eq!(registry.class_key("Gauge"), Some("Gauge"));
        assert!(registry.method("Gauge::level()").unwrap().gathers());
        assert!(!registry.method("Gauge::raise()").unwrap().gathers());
        assert!(registry.method("Gauge::lower()").is_none());
    }

    #[test]
    fn erased_calls_reach_the_instance() {
        let registry = registry();
        let mut object = registry.construct("Gauge").unwrap();

        let raise = registry.method(Raise::NAME).unwrap();
        assert_eq!(raise.invoke(object.as_mut(), &[]).unwrap(), None);
        assert_eq!(raise.invoke(object.as_mut(), &[]).unwrap(), None);

        let level = registry.method(Level::NAME).unwrap();
        let bytes = level.invoke(object.as_mut(), &[]).unwrap().unwrap();
        assert_eq!(u64::from_payload(&bytes).unwrap(), 2);

        let set = registry.method(SetLevel::NAME).unwrap();
        let argument = 250u64.to_payload().unwrap();
        assert_eq!(
            set.invoke(object.as_mut(), &argument),
            Err(Failure::User("bad value".into()))
        );
        let argument = 9u64.to_payload().unwrap();
        set.invoke(object.as_mut(), &argument).unwrap();
        assert_eq!(object.downcast_ref::<Gauge>().unwrap().level, 9);
    }

    #[test]
    fn wrong_class_is_an_internal_failure() {
        let registry = registry();
        let mut other: Box<dyn Any> = Box::new(Other);
        let raise = registry.method(Raise::NAME).unwrap();
        assert!(matches!(
            raise.invoke(other.as_mut(), &[]),
            Err(Failure::Internal(_))
        ));
    }

    #[test]
    fn custom_factory_is_used() {
        let mut registry = Registry::new();
        registry.register_class_with(|| Gauge { level: 40 });
        let object = registry.construct("Gauge").unwrap();
        assert_eq!(object.downcast_ref::<Gauge>().unwrap().level, 40);
    }
}
