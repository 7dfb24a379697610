//! # luadoop: map/reduce components written in Lua
//!
//! luadoop lets the components of a batch map/reduce job (mappers, reducers,
//! combiners, partitioners, comparators, input formats and record readers)
//! be written as Lua classes, while the framework itself stays native.
//!
//! - **Bridge** (`bridge`): an embedded Lua runtime shared by the process,
//!   class resolution from job configuration, and managed script instances
//!   with capability detection
//! - **Adapters** (`adapters`): host component implementations that forward
//!   each lifecycle call to a script instance
//! - **Host** (`host`): component contracts, configuration and a sequential
//!   local engine
//! - **Runner** (`runner`): loads a job setup script and runs its jobs
//!
//! ## Example: word count
//!
//! ```lua
//! WordCount = {}
//!
//! WordCount.Mapper = luadoop.class()
//! function WordCount.Mapper:map(offset, line, ctx)
//!   for word in string.gmatch(line, '%S+') do ctx:write(word, 1) end
//! end
//!
//! WordCount.Reducer = luadoop.class()
//! function WordCount.Reducer:reduce(word, counts, ctx)
//!   local total = 0
//!   for n in counts do total = total + n end
//!   ctx:write(word, total)
//! end
//!
//! luadoop.run(function(input, output)
//!   luadoop.job('word_count', function(job)
//!     job:input(input)
//!     job:output(output)
//!     job:mapper('WordCount.Mapper')
//!     job:reducer('WordCount.Reducer')
//!   end)
//! end)
//! ```

pub mod adapters;
pub mod bridge;
pub mod host;
pub mod runner;

pub use adapters::{
    ComparatorProxy, InputFormatProxy, MapperProxy, PartitionerProxy, RecordReaderProxy, ReducerProxy,
};
pub use bridge::{BridgeError, ConfigurationResolver, InterpreterHandle, ManagedInstance, Role};
pub use host::{Configuration, Datum, TaskError, TaskResult};
pub use runner::{JobDefinition, JobPlan, JobRunner, JobSet, RunnerError};
