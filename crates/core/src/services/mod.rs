//! Ports to the collaborators maintenance handlers read and mutate.
//!
//! Persistence, the search cluster, billing and geo lookup live outside this
//! workspace; handlers only see these traits.

#![allow(missing_docs)]

pub mod billing;
pub mod geo;
pub mod mail;
pub mod repositories;
pub mod search;

pub use billing::{BillingGateway, NoOpBillingGateway};
pub use geo::GeoLookup;
pub use mail::{MailMessage, MailSender, NoOpMailSender, SmtpMailSender};
pub use repositories::{
    EventRepository, OrganizationRepository, ProjectRepository, StackRepository,
    TokenRepository, UserRepository, WebHookRepository,
};
pub use search::{
    BulkItemFailure, BulkResponse, ScrollPage, ScrollQuery, SearchDocument, SearchIndexClient,
};
