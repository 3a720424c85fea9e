// 代理连接模块
// 目标主机位于堡垒代理之后时，通过 HTTP CONNECT 或 SOCKS5 建立隧道

use std::net::SocketAddr;
use std::time::Duration;

use tokio::net::{lookup_host, TcpStream};
use tokio::time::timeout;

use super::config::{ProxyConfig, ProxyType};
use super::error::SshError;

/// 通过代理连接到目标主机
pub async fn connect_via_proxy(
    proxy: &ProxyConfig,
    target_host: &str,
    target_port: u16,
    connect_timeout: Duration,
) -> Result<TcpStream, SshError> {
    let proxy_addr = resolve_proxy(proxy).await?;

    match proxy.proxy_type {
        ProxyType::Socks5 => {
            connect_socks5(proxy_addr, proxy, target_host, target_port, connect_timeout).await
        }
        ProxyType::Http => {
            connect_http(proxy_addr, proxy, target_host, target_port, connect_timeout).await
        }
    }
}

async fn resolve_proxy(proxy: &ProxyConfig) -> Result<SocketAddr, SshError> {
    let addr = format!("{}:{}", proxy.host, proxy.port);
    if let Ok(socket) = addr.parse::<SocketAddr>() {
        return Ok(socket);
    }
    let resolved = lookup_host(addr.as_str())
        .await
        .map_err(|e| SshError::Proxy(format!("Failed to resolve proxy address {}: {}", addr, e)))?
        .next()
        .ok_or_else(|| SshError::Proxy(format!("No valid proxy address for {}", addr)));
    resolved
}

async fn connect_socks5(
    proxy_addr: SocketAddr,
    proxy: &ProxyConfig,
    target_host: &str,
    target_port: u16,
    connect_timeout: Duration,
) -> Result<TcpStream, SshError> {
    use tokio_socks::tcp::Socks5Stream;

    let target = (target_host, target_port);

    let result = match &proxy.auth {
        Some((username, password)) => {
            timeout(
                connect_timeout,
                Socks5Stream::connect_with_password(proxy_addr, target, username, password),
            )
            .await
        }
        None => timeout(connect_timeout, Socks5Stream::connect(proxy_addr, target)).await,
    };

    let stream = result
        .map_err(|_| SshError::Proxy("SOCKS5 proxy connection timeout".to_string()))?
        .map_err(|e| SshError::Proxy(format!("SOCKS5 proxy connection failed: {}", e)))?;

    Ok(stream.into_inner())
}

async fn connect_http(
    proxy_addr: SocketAddr,
    proxy: &ProxyConfig,
    target_host: &str,
    target_port: u16,
    connect_timeout: Duration,
) -> Result<TcpStream, SshError> {
    use async_http_proxy::{http_connect_tokio, http_connect_tokio_with_basic_auth};

    let mut stream = timeout(connect_timeout, TcpStream::connect(proxy_addr))
        .await
        .map_err(|_| SshError::Proxy("HTTP proxy connection timeout".to_string()))?
        .map_err(|e| SshError::Proxy(format!("Failed to connect to HTTP proxy: {}", e)))?;

    let result = match &proxy.auth {
        Some((username, password)) => {
            timeout(
                connect_timeout,
                http_connect_tokio_with_basic_auth(
                    &mut stream,
                    target_host,
                    target_port,
                    username,
                    password,
                ),
            )
            .await
        }
        None => {
            timeout(
                connect_timeout,
                http_connect_tokio(&mut stream, target_host, target_port),
            )
            .await
        }
    };

    result
        .map_err(|_| SshError::Proxy("HTTP CONNECT tunnel timeout".to_string()))?
        .map_err(|e| SshError::Proxy(format!("HTTP CONNECT tunnel failed: {}", e)))?;

    Ok(stream)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_resolve_literal_proxy_address() {
        let proxy = ProxyConfig {
            proxy_type: ProxyType::Socks5,
            host: "127.0.0.1".to_string(),
            port: 1080,
            auth: None,
        };
        let addr = resolve_proxy(&proxy).await.unwrap();
        assert_eq!(addr.port(), 1080);
    }

    #[tokio::test]
    async fn test_resolve_named_proxy_address() {
        let proxy = ProxyConfig {
            proxy_type: ProxyType::Http,
            host: "localhost".to_string(),
            port: 3128,
            auth: None,
        };
        let addr = resolve_proxy(&proxy).await.unwrap();
        assert!(addr.ip().is_loopback());
        assert_eq!(addr.port(), 3128);
    }
}
