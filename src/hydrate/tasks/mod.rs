mod inline;
mod loc;
mod meds;
mod obs;

pub use inline::{default_mimetypes, parse_mimetypes, InlineDocTask, InlineDxrTask};
pub use loc::location_tasks;
pub use meds::MedsTask;
pub use obs::{ObsDxrTask, ObsMembersTask};
