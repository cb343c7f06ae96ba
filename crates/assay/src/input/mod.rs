//! Row sources and row identity.

mod parser;
mod row;
mod source;

pub use parser::{CsvDatastore, Parser, ParserConfig};
pub use row::{IdScope, InputRow, RowId, RowIdGenerator};
pub use source::{
    DataTable, Datastore, DatastoreConnection, MemoryDatastore, RowIter, RowRange, SourceColumn,
    SourceMetadata, SourceRow,
};
