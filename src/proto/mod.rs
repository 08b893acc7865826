//! Protocol engines. HTTP/1.x lives in [`h1`]; HTTP/2 is a sibling
//! project and is deliberately not handled here.

pub(crate) mod h1;
