//! 指令路由：按注册中心推送的路由指令合并分组、按 IP 定向，并在拓扑或指令变化时重算。

pub mod driver;
pub mod manager;
pub mod model;
pub mod rule;

pub use driver::CommandDriver;
pub use manager::CommandServiceManager;
pub use model::{ClientCommand, RoutingCommand};
pub use rule::{GroupWeight, IpPattern, RouteRule, pattern_matches};
