/// Declare an RPC interface once, for both ends.
///
/// Generates:
///
/// - the server trait, whose methods return [`Response`](crate::Response);
/// - a server adapter implementing [`Service`](crate::service::Service),
///   which registers each method under its ordinal;
/// - a client proxy whose methods call through a [`Client`](crate::Client).
///
/// The adapter and proxy names are given explicitly. Methods without a
/// result must spell out `-> ()`.
///
/// ```
/// rawrpc::service! {
///     pub trait Calculator {
///         fn add(&self, a: i64, b: i64) -> i64;
///         fn reset(&self) -> ();
///     }
///     server CalculatorServer;
///     proxy CalculatorProxy;
/// }
///
/// struct Calc;
///
/// impl Calculator for Calc {
///     fn add(&self, a: i64, b: i64) -> rawrpc::Response<i64> {
///         Ok(a + b)
///     }
///     fn reset(&self) -> rawrpc::Response<()> {
///         Ok(())
///     }
/// }
///
/// let server = rawrpc::Server::new(rawrpc::Config::new())
///     .add_service(CalculatorServer::new(Calc));
/// # drop(server);
/// ```
#[macro_export]
macro_rules! service {
    (
        $(#[$attr:meta])*
        $vis:vis trait $name:ident {
            $(
                $(#[$mattr:meta])*
                fn $method:ident(&self $(, $arg:ident : $ty:ty)* $(,)?) -> $ret:ty;
            )*
        }
        server $server:ident;
        proxy $proxy:ident;
    ) => {
        $(#[$attr])*
        $vis trait $name: Send + Sync + 'static {
            $(
                $(#[$mattr])*
                fn $method(&self $(, $arg: $ty)*) -> $crate::Response<$ret>;
            )*
        }

        $vis struct $server<T: $name>(::std::sync::Arc<T>);

        impl<T: $name> $server<T> {
            pub const NAME: &'static str = ::std::stringify!($name);

            pub fn new(inner: T) -> Self {
                Self(::std::sync::Arc::new(inner))
            }

            pub fn from_arc(inner: ::std::sync::Arc<T>) -> Self {
                Self(inner)
            }

            pub fn inner(&self) -> &::std::sync::Arc<T> {
                &self.0
            }
        }

        impl<T: $name> $crate::service::Service for $server<T> {
            fn descriptor(self) -> $crate::service::ServiceDescriptor {
                let builder = $crate::service::ServiceDescriptor::builder(Self::NAME);
                $(
                    let builder = {
                        let inner = self.0.clone();
                        const PARAMS: &[&str] = &[$(::std::stringify!($ty)),*];
                        builder.method(
                            $crate::service::MethodSignature {
                                name: ::std::stringify!($method),
                                params: PARAMS,
                            },
                            move |args| {
                                #[allow(unused_mut, unused_variables)]
                                let mut args = $crate::service::Args::new(args, PARAMS)?;
                                $( let $arg: $ty = args.next()?; )*
                                inner
                                    .$method($($arg),*)
                                    .map($crate::value::IntoValue::into_value)
                            },
                        )
                    };
                )*
                builder.build()
            }
        }

        $vis struct $proxy {
            client: ::std::sync::Arc<$crate::Client>,
            table: $crate::service::OrdinalTable,
        }

        impl $proxy {
            pub const NAME: &'static str = ::std::stringify!($name);
            pub const SERVICE_HASH: u64 = $crate::service::service_hash(Self::NAME);
            pub const SIGNATURES: &'static [$crate::service::MethodSignature] = &[
                $(
                    $crate::service::MethodSignature {
                        name: ::std::stringify!($method),
                        params: &[$(::std::stringify!($ty)),*],
                    },
                )*
            ];

            pub fn new(client: ::std::sync::Arc<$crate::Client>) -> Self {
                Self {
                    client,
                    table: $crate::service::OrdinalTable::new(Self::SIGNATURES),
                }
            }

            pub fn client(&self) -> &::std::sync::Arc<$crate::Client> {
                &self.client
            }

            $(
                $(#[$mattr])*
                pub fn $method(&self $(, $arg: $ty)*) -> ::std::result::Result<$ret, $crate::Error> {
                    let sig = $crate::service::MethodSignature {
                        name: ::std::stringify!($method),
                        params: &[$(::std::stringify!($ty)),*],
                    };
                    let ordinal = self
                        .table
                        .ordinal(&sig)
                        .ok_or($crate::Error::UnknownMethod(::std::stringify!($method)))?;
                    let args = ::std::vec![$($crate::value::IntoValue::into_value($arg)),*];
                    let value = self.client.invoke(Self::SERVICE_HASH, ordinal, args)?;
                    <$ret as $crate::value::FromValue>::from_value(value)
                        .map_err($crate::Error::Coerce)
                }
            )*
        }
    };
}

macro_rules! log {
    ($level: ident, $($t:tt)*) => {{
        #[cfg(feature = "log")]
        { ::log::$level!($($t)*) }
        // Silence unused variables warnings.
        #[cfg(not(feature = "log"))]
        { if false { let _ = ( $($t)* ); } }
    }}
}

macro_rules! error {
    ($($t:tt)*) => {
        $crate::macros::log!(error, $($t)*)
    }
}

// `warn` itself would clash with the built-in lint attribute
macro_rules! warn_ {
    ($($t:tt)*) => {
        $crate::macros::log!(warn, $($t)*)
    }
}

macro_rules! info {
    ($($t:tt)*) => {
        $crate::macros::log!(info, $($t)*)
    }
}

macro_rules! debug {
    ($($t:tt)*) => {
        $crate::macros::log!(debug, $($t)*)
    }
}

macro_rules! trace {
    ($($t:tt)*) => {
        $crate::macros::log!(trace, $($t)*)
    };
}

pub(crate) use debug;
pub(crate) use error;
pub(crate) use info;
pub(crate) use log;
pub(crate) use trace;
pub(crate) use warn_ as warn;
