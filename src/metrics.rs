//! Счётчики клиентского соединения (lock-free) и их сериализуемый снимок.

use crate::ldap_protocol::ProtocolOp;
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};

/// Счётчики метрик (thread-safe, lock-free).
#[derive(Debug, Default)]
pub struct Metrics {
    /// Успешно открытые транспортные сессии.
    pub connections_opened: AtomicU64,
    /// Отправленные запросы по типам операций.
    pub requests_bind: AtomicU64,
    pub requests_search: AtomicU64,
    pub requests_extended: AtomicU64,
    pub requests_other: AtomicU64,
    /// Ответы, доставленные зарегистрированному ожидающему.
    pub responses_routed: AtomicU64,
    /// Записи (SearchResultEntry), доставленные потокам поиска.
    pub entries_received: AtomicU64,
    /// Кадры с неизвестным messageID (отброшены).
    pub frames_discarded: AtomicU64,
    /// Ошибки разбора BER, после которых соединение закрывается.
    pub protocol_errors: AtomicU64,
    /// Соединения, потерянные не по инициативе клиента.
    pub connections_lost: AtomicU64,
}

/// Снимок [`Metrics`] на момент вызова.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct MetricsSnapshot {
    pub connections_opened: u64,
    pub requests_bind: u64,
    pub requests_search: u64,
    pub requests_extended: u64,
    pub requests_other: u64,
    pub responses_routed: u64,
    pub entries_received: u64,
    pub frames_discarded: u64,
    pub protocol_errors: u64,
    pub connections_lost: u64,
}

impl Metrics {
    pub fn new() -> Self {
        Self::default()
    }

    #[inline]
    pub fn inc_connections(&self) {
        self.connections_opened.fetch_add(1, Ordering::Relaxed);
    }

    /// Увеличивает счётчик запросов по типу отправленной операции.
    #[inline]
    pub fn inc_request(&self, op: &ProtocolOp) {
        let counter = match op {
            ProtocolOp::BindRequest(_) => &self.requests_bind,
            ProtocolOp::SearchRequest(_) => &self.requests_search,
            ProtocolOp::ExtendedRequest(_) => &self.requests_extended,
            _ => &self.requests_other,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn inc_routed(&self) {
        self.responses_routed.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn inc_entries(&self) {
        self.entries_received.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn inc_discarded(&self) {
        self.frames_discarded.fetch_add(1, Ordering::Relaxed);
    }

    /// Увеличивает счётчик ошибок разбора (не SEQUENCE в начале, неверная длина и т.д.).
    #[inline]
    pub fn inc_protocol_error(&self) {
        self.protocol_errors.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn inc_connections_lost(&self) {
        self.connections_lost.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            connections_opened: self.connections_opened.load(Ordering::Relaxed),
            requests_bind: self.requests_bind.load(Ordering::Relaxed),
            requests_search: self.requests_search.load(Ordering::Relaxed),
            requests_extended: self.requests_extended.load(Ordering::Relaxed),
            requests_other: self.requests_other.load(Ordering::Relaxed),
            responses_routed: self.responses_routed.load(Ordering::Relaxed),
            entries_received: self.entries_received.load(Ordering::Relaxed),
            frames_discarded: self.frames_discarded.load(Ordering::Relaxed),
            protocol_errors: self.protocol_errors.load(Ordering::Relaxed),
            connections_lost: self.connections_lost.load(Ordering::Relaxed),
        }
    }
}
