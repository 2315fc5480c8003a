//! Typed tool-call facade: search and get-paper re-exported as
//! method-dispatched JSON tool calls over the bus's request/reply protocol.

pub mod facade;

pub use facade::{
    GetPaperInput, SearchToolInput, ToolError, ToolFacade, ToolRequest, ToolResponse,
    INTERNAL_ERROR, INVALID_PARAMS, INVALID_REQUEST, METHOD_NOT_FOUND, PARSE_ERROR,
};
