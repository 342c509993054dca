//! UPnP 포트 포워딩 연동
//!
//! 구현은 외부 협력자. 피어는 시작 시 `discover`를 호출하고 결과를 기다리지 않음.

use std::net::IpAddr;

pub trait Upnp: Send + Sync {
    /// 게이트웨이 탐색 시작 (결과를 기다리지 않음)
    fn discover(&self);

    fn forward_port(&self, port: u16, description: &str) -> bool;

    fn external_ip(&self) -> Option<IpAddr>;
}
