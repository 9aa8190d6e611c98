//! Service descriptors and the ordinal contract.
//!
//! A service is identified on the wire by a 64-bit hash of its interface
//! name, and each method by its 1-based position after sorting all methods
//! by `name|param|param...`. Both ends derive the ordinal from the same
//! signature list, so no method names travel on the wire.

use std::fmt;

use crate::status::Status;
use crate::value::{FromValue, Value};
use crate::Response;

/// Stable hash of an interface name: 64-bit FNV-1a.
pub const fn service_hash(name: &str) -> u64 {
    let bytes = name.as_bytes();
    let mut hash: u64 = 0xcbf2_9ce4_8422_2325;
    let mut i = 0;
    while i < bytes.len() {
        hash ^= bytes[i] as u64;
        hash = hash.wrapping_mul(0x0100_0000_01b3);
        i += 1;
    }
    hash
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MethodSignature {
    pub name: &'static str,
    /// Parameter type names in declaration order.
    pub params: &'static [&'static str],
}

impl MethodSignature {
    pub fn sort_key(&self) -> String {
        let mut key = String::from(self.name);
        for p in self.params {
            key.push('|');
            key.push_str(p);
        }
        key
    }
}

impl fmt::Display for MethodSignature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}({})", self.name, self.params.join(", "))
    }
}

/// Sorted method keys, for callers who only know signatures.
#[derive(Debug, Clone)]
pub struct OrdinalTable {
    keys: Vec<String>,
}

impl OrdinalTable {
    pub fn new(signatures: &[MethodSignature]) -> Self {
        let mut keys: Vec<String> = signatures.iter().map(MethodSignature::sort_key).collect();
        keys.sort();
        Self { keys }
    }

    pub fn ordinal(&self, sig: &MethodSignature) -> Option<u32> {
        let key = sig.sort_key();
        self.keys
            .binary_search(&key)
            .ok()
            .map(|i| i as u32 + 1)
    }

    pub fn len(&self) -> usize {
        self.keys.len()
    }

    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }
}

type Handler = Box<dyn Fn(Vec<Value>) -> Response<Value> + Send + Sync>;

pub struct Method {
    signature: MethodSignature,
    handler: Handler,
}

impl Method {
    pub fn signature(&self) -> &MethodSignature {
        &self.signature
    }

    pub fn call(&self, args: Vec<Value>) -> Response<Value> {
        (self.handler)(args)
    }
}

/// One registered interface with its methods in ordinal order.
pub struct ServiceDescriptor {
    name: &'static str,
    hash: u64,
    methods: Vec<Method>,
}

impl ServiceDescriptor {
    pub fn builder(name: &'static str) -> DescriptorBuilder {
        DescriptorBuilder {
            name,
            methods: Vec::new(),
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn hash(&self) -> u64 {
        self.hash
    }

    /// Method at the 1-based `ordinal`.
    pub fn method(&self, ordinal: u32) -> Option<&Method> {
        let index = (ordinal as usize).checked_sub(1)?;
        self.methods.get(index)
    }

    pub fn methods(&self) -> impl Iterator<Item = (u32, &MethodSignature)> {
        self.methods
            .iter()
            .enumerate()
            .map(|(i, m)| (i as u32 + 1, &m.signature))
    }

    pub fn len(&self) -> usize {
        self.methods.len()
    }

    pub fn is_empty(&self) -> bool {
        self.methods.is_empty()
    }
}

impl fmt::Debug for ServiceDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ServiceDescriptor")
            .field("name", &self.name)
            .field("hash", &format_args!("{:#018x}", self.hash))
            .field("methods", &self.methods.len())
            .finish()
    }
}

pub struct DescriptorBuilder {
    name: &'static str,
    methods: Vec<Method>,
}

impl DescriptorBuilder {
    pub fn method<F>(mut self, signature: MethodSignature, handler: F) -> Self
    where
        F: Fn(Vec<Value>) -> Response<Value> + Send + Sync + 'static,
    {
        self.methods.push(Method {
            signature,
            handler: Box::new(handler),
        });
        self
    }

    pub fn build(mut self) -> ServiceDescriptor {
        self.methods
            .sort_by_cached_key(|m| m.signature.sort_key());
        for pair in self.methods.windows(2) {
            assert!(
                pair[0].signature.sort_key() != pair[1].signature.sort_key(),
                "duplicate method {} in service {}",
                pair[0].signature,
                self.name
            );
        }
        ServiceDescriptor {
            name: self.name,
            hash: service_hash(self.name),
            methods: self.methods,
        }
    }
}

/// Anything that can be registered with a dispatcher.
///
/// Implemented by the server adapters that [`service!`](crate::service!)
/// generates, and by a hand-built [`ServiceDescriptor`].
pub trait Service {
    fn descriptor(self) -> ServiceDescriptor;
}

impl Service for ServiceDescriptor {
    fn descriptor(self) -> ServiceDescriptor {
        self
    }
}

/// Positional arguments being coerced to declared parameter types.
pub struct Args {
    iter: std::vec::IntoIter<Value>,
    params: &'static [&'static str],
    index: usize,
}

impl Args {
    pub fn new(args: Vec<Value>, params: &'static [&'static str]) -> Result<Self, Status> {
        if args.len() != params.len() {
            return Err(Status::invalid_argument(format!(
                "expected {} arguments, got {}",
                params.len(),
                args.len()
            )));
        }
        Ok(Self {
            iter: args.into_iter(),
            params,
            index: 0,
        })
    }

    #[allow(clippy::should_implement_trait)]
    pub fn next<T: FromValue>(&mut self) -> Result<T, Status> {
        let index = self.index;
        self.index += 1;
        let value = self
            .iter
            .next()
            .ok_or_else(|| Status::invalid_argument(format!("missing argument {index}")))?;
        T::from_value(value).map_err(|s| {
            let param = self.params.get(index).copied().unwrap_or("?");
            Status::new(s.code, format!("argument {index} ({param}): {}", s.message))
        })
    }
}
