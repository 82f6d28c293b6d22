/// Declares a marker type naming one method of a parallel class.
///
/// ```ignore
/// parallel_method!(pub Increment => Counter::increment() -> ());
/// parallel_method!(pub Count => Counter::count() -> u64);
/// parallel_method!(pub SetStep => Counter::set_step(u64) -> Result<(), UserError>);
/// ```
///
/// The method name is `"Counter::increment()"` (or `"Counter::set_step(u64)"`
/// for methods with an argument). Use `Marker = "name" => ...` to pick the
/// name explicitly, e.g. when the class name is namespaced.
#[macro_export]
macro_rules! parallel_method {
    (
        $(#[$meta:meta])*
        $vis:vis $marker:ident = $name:expr => $class:ident :: $method:ident () -> $ret:ty
    ) => {
        $(#[$meta])*
        $vis struct $marker;

        impl $crate::Method for $marker {
            type Class = $class;
            type Output = <$ret as $crate::IntoOutcome>::Output;
            const NAME: &'static str = $name;

            fn call(target: &mut $class) -> ::std::result::Result<Self::Output, $crate::UserError> {
                $crate::IntoOutcome::into_outcome(target.$method())
            }
        }
    };
    (
        $(#[$meta:meta])*
        $vis:vis $marker:ident = $name:expr => $class:ident :: $method:ident ($arg:ty) -> $ret:ty
    ) => {
        $(#[$meta])*
        $vis struct $marker;

        impl $crate::MethodWithArgument for $marker {
            type Class = $class;
            type Argument = $arg;
            type Output = <$ret as $crate::IntoOutcome>::Output;
            const NAME: &'static str = $name;

            fn call(
                target: &mut $class,
                argument: $arg,
            ) -> ::std::result::Result<Self::Output, $crate::UserError> {
                $crate::IntoOutcome::into_outcome(target.$method(argument))
            }
        }
    };
    (
        $(#[$meta:meta])*
        $vis:vis $marker:ident => $class:ident :: $method:ident () -> $ret:ty
    ) => {
        $crate::parallel_method!(
            $(#[$meta])*
            $vis $marker = concat!(stringify!($class), "::", stringify!($method), "()")
                => $class::$method() -> $ret
        );
    };
    (
        $(#[$meta:meta])*
        $vis:vis $marker:ident => $class:ident :: $method:ident ($arg:ty) -> $ret:ty
    ) => {
        $crate::parallel_method!(
            $(#[$meta])*
            $vis $marker = concat!(
                stringify!($class), "::", stringify!($method), "(", stringify!($arg), ")"
            ) => $class::$method($arg) -> $ret
        );
    };
}

/// Generates a wrapper around [`ParallelObject`](crate::ParallelObject) that
/// forwards plain calls, so user code can write `counter.increment()`
/// instead of `object.invoke::<Increment>()`.
///
/// ```ignore
/// parallel_proxy! {
///     pub struct CounterProxy(Counter) {
///         fn increment() => Increment;
///         set set_step(u64) => SetStep;
///         gather count() => Count;
///     }
/// }
/// ```
#[macro_export]
macro_rules! parallel_proxy {
    (
        $(#[$meta:meta])*
        $vis:vis struct $proxy:ident($class:ty) {
            $(fn $name:ident() => $marker:ty;)*
            $(set $set_name:ident($arg:ty) => $set_marker:ty;)*
            $(gather $gather_name:ident() => $gather_marker:ty;)*
        }
    ) => {
        $(#[$meta])*
        $vis struct $proxy($crate::ParallelObject<$class>);

        #[allow(dead_code)]
        impl $proxy {
            pub fn create(
                controller: &$crate::Controller,
                local: $class,
            ) -> ::std::result::Result<Self, $crate::Error> {
                controller.create(local).map($proxy)
            }

            pub fn local(&self) -> &$class {
                self.0.local()
            }

            pub fn object(&self) -> &$crate::ParallelObject<$class> {
                &self.0
            }

            pub fn object_mut(&mut self) -> &mut $crate::ParallelObject<$class> {
                &mut self.0
            }

            pub fn destroy(self) -> ::std::result::Result<(), $crate::Error> {
                self.0.destroy()
            }

            $(
                pub fn $name(
                    &mut self,
                ) -> ::std::result::Result<<$marker as $crate::Method>::Output, $crate::Error> {
                    self.0.invoke::<$marker>()
                }
            )*

            $(
                pub fn $set_name(
                    &mut self,
                    value: $arg,
                ) -> ::std::result::Result<
                    <$set_marker as $crate::MethodWithArgument>::Output,
                    $crate::Error,
                > {
                    self.0.invoke_with_argument::<$set_marker>(value)
                }
            )*

            $(
                pub fn $gather_name(
                    &mut self,
                ) -> ::std::result::Result<
                    ::std::vec::Vec<<$gather_marker as $crate::Method>::Output>,
                    $crate::Error,
                > {
                    self.0.invoke_gather::<$gather_marker>()
                }
            )*
        }
    };
}
