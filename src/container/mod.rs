//! Service container subsystem.
//!
//! # Data Flow
//! ```text
//! ServiceDefinitions (name → factory)
//!     → ServiceContainer::new (reserved names rejected)
//!     → resolve(name): built-in? cached? building here (cycle) or elsewhere (wait)? → run factory → cache
//! ```
//!
//! # Design Decisions
//! - Factories run on first access, at most once per successful build
//! - A failed build is not cached; the next access retries
//! - Built-ins are fixed per run and cannot be overridden
//! - `services!` gives typed accessors over the name-keyed registry

pub mod builtins;
pub mod registry;

pub use builtins::{is_reserved, Builtins, ServiceValue, RESERVED_NAMES};
pub use registry::{ContainerError, ServiceContainer, ServiceDefinitions};

/// Declare a trait of typed accessors implemented by [`ServiceContainer`].
///
/// ```ignore
/// services! {
///     pub trait AppServices {
///         database: Database,
///         cache: Cache,
///     }
/// }
///
/// let db = container.database()?; // Arc<Database>
/// ```
#[macro_export]
macro_rules! services {
    ($(#[$meta:meta])* $vis:vis trait $name:ident { $($service:ident : $ty:ty),* $(,)? }) => {
        $(#[$meta])*
        $vis trait $name {
            $(
                fn $service(&self) -> ::std::result::Result<
                    ::std::sync::Arc<$ty>,
                    $crate::container::ContainerError,
                >;
            )*
        }

        impl $name for $crate::container::ServiceContainer {
            $(
                fn $service(&self) -> ::std::result::Result<
                    ::std::sync::Arc<$ty>,
                    $crate::container::ContainerError,
                > {
                    self.get::<$ty>(stringify!($service))
                }
            )*
        }
    };
}
