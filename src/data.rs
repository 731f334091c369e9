pub mod stream;

use stream::Stream;

/// A store slot's payload: an opaque string or an append-only stream.
#[derive(Debug, Clone)]
pub enum Value {
    Str(Vec<u8>),
    Stream(Stream),
}

impl Value {
    pub fn type_name(&self) -> &'static str {
        match self {
            Value::Str(_) => "string",
            Value::Stream(_) => "stream",
        }
    }
}
