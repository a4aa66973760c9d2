pub mod algorithms;
pub mod graph;
pub mod io;
pub mod orm;
pub mod query;

pub use graph::{attrs, EdgeId, Graph};
pub use io::GraphDocument;
pub use orm::{ElementId, GraphOrm, View};
pub use query::{Predicate, Query, Scope};
