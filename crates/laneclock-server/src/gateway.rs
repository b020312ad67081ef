//! Authorization and broadcast boundary for the race session.
//!
//! `SessionGateway` owns both the role registry and the timer. It is driven
//! by exactly one task (see `server::run_gateway`), so every event runs
//! read-decide-mutate to completion before the next one is looked at. It does
//! no I/O itself: each call returns the deliveries the transport must make.

use std::sync::Arc;

use laneclock_core::{Clock, ConnectionId, ElapsedSource, Role, RoleRegistry, StopOutcome, TimerSession};

use crate::protocol::{InboundEvent, OutboundEvent, SessionSnapshot};

/// Where an outbound event goes.
#[derive(Clone, Debug, PartialEq)]
pub enum Delivery {
    /// Every connection, the sender included.
    Broadcast(OutboundEvent),
    /// Only the connection that sent the triggering event.
    Reply(OutboundEvent),
}

pub struct SessionGateway {
    roles: RoleRegistry,
    timer: TimerSession,
}

impl SessionGateway {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            roles: RoleRegistry::new(),
            timer: TimerSession::new(clock),
        }
    }

    pub fn roles(&self) -> &RoleRegistry {
        &self.roles
    }

    pub fn timer(&self) -> &TimerSession {
        &self.timer
    }

    pub fn snapshot(&self) -> SessionSnapshot {
        SessionSnapshot {
            start_timestamp: self.timer.start_timestamp(),
            lanes: self.timer.lanes(),
            held_roles: self.roles.held_roles(),
        }
    }

    /// Release the connection's role. Timer state is left alone.
    pub fn disconnect(&mut self, connection: &ConnectionId) -> Option<Role> {
        let released = self.roles.release_connection(connection);
        match released {
            Some(role) => tracing::info!(connection_id = %connection, role = %role, "Connection closed, role released"),
            None => tracing::debug!(connection_id = %connection, "Connection closed"),
        }
        released
    }

    /// Process one inbound event from `from`.
    ///
    /// Unauthorized events are logged and produce no deliveries.
    pub fn handle(&mut self, from: &ConnectionId, event: InboundEvent) -> Vec<Delivery> {
        if let Some(required) = event.required_role() {
            let held = self.roles.role_of(from);
            if held != Some(required) {
                let role = held.map(|r| r.to_string());
                tracing::warn!(
                    connection_id = %from,
                    role = role.as_deref(),
                    event = event.name(),
                    required = %required,
                    "Unauthorized attempt"
                );
                return Vec::new();
            }
        }

        match event {
            InboundEvent::RequestRole { role } => self.request_role(from, role),
            InboundEvent::StartTimer => {
                let start_timestamp = self.timer.start();
                tracing::info!(start_timestamp, "Race started");
                vec![Delivery::Broadcast(OutboundEvent::StartTimer { start_timestamp })]
            }
            InboundEvent::StopTimer { lane, client_stop_ms } => {
                match self.timer.stop_lane(lane, client_stop_ms) {
                    StopOutcome::Recorded { elapsed, source } => {
                        tracing::info!(lane = lane.number(), elapsed, source = ?source, "Lane stopped");
                        vec![
                            Delivery::Broadcast(OutboundEvent::StopTimer { lane_id: lane, elapsed, source }),
                            Delivery::Reply(OutboundEvent::StopAck { lane_id: lane, elapsed }),
                        ]
                    }
                    StopOutcome::AlreadyFinalized(elapsed) => {
                        tracing::info!(lane = lane.number(), elapsed, "Stop ignored, lane already recorded");
                        vec![Delivery::Reply(OutboundEvent::StopIgnored {
                            lane_id: lane,
                            elapsed: Some(elapsed),
                            reason: None,
                        })]
                    }
                }
            }
            InboundEvent::AdminStopLane { lane } => match self.timer.admin_override_lane(lane) {
                Ok(elapsed) => {
                    tracing::info!(lane = lane.number(), elapsed, "Admin stopped lane");
                    vec![Delivery::Broadcast(OutboundEvent::StopTimer {
                        lane_id: lane,
                        elapsed,
                        source: ElapsedSource::Admin,
                    })]
                }
                Err(e) => vec![Delivery::Reply(OutboundEvent::StopIgnored {
                    lane_id: lane,
                    elapsed: None,
                    reason: Some(e.reason()),
                })],
            },
            InboundEvent::ResendTimer { lane, elapsed } => match self.timer.resend_lane_time(lane, elapsed) {
                Ok(elapsed) => {
                    tracing::info!(lane = lane.number(), elapsed, "Lane time resent");
                    vec![
                        Delivery::Broadcast(OutboundEvent::ResendTimer {
                            lane_id: lane,
                            elapsed,
                            source: ElapsedSource::Resend,
                        }),
                        Delivery::Reply(OutboundEvent::StopAck { lane_id: lane, elapsed }),
                    ]
                }
                Err(e) => {
                    tracing::info!(lane = lane.number(), reason = e.reason(), "Resend rejected");
                    vec![Delivery::Reply(OutboundEvent::ResendRejected {
                        lane_id: lane,
                        reason: e.reason(),
                    })]
                }
            },
            InboundEvent::StopAllTimers => match self.timer.stop_all() {
                Ok(elapsed) => {
                    tracing::info!(elapsed = ?elapsed, "Admin stopped all lanes");
                    vec![Delivery::Broadcast(OutboundEvent::StopAllTimers { elapsed })]
                }
                Err(e) => vec![Delivery::Reply(OutboundEvent::StopAllIgnored { reason: e.reason() })],
            },
            InboundEvent::ResetAllTimers => {
                self.timer.reset();
                tracing::info!("Race reset");
                vec![Delivery::Broadcast(OutboundEvent::ResetAllTimers)]
            }
            InboundEvent::AssignStudents(payload) => {
                vec![Delivery::Broadcast(OutboundEvent::AssignStudents(payload))]
            }
            InboundEvent::ClearStudents => vec![Delivery::Broadcast(OutboundEvent::ClearStudents)],
            InboundEvent::SyncState => vec![Delivery::Reply(OutboundEvent::State(self.snapshot()))],
        }
    }

    fn request_role(&mut self, from: &ConnectionId, requested: String) -> Vec<Delivery> {
        let result = requested
            .parse::<Role>()
            .and_then(|role| self.roles.request_role(from, role).map(|()| role));

        let response = match result {
            Ok(role) => {
                tracing::info!(connection_id = %from, role = %role, "Role assigned");
                OutboundEvent::RoleResponse {
                    success: true,
                    role: requested,
                    message: None,
                }
            }
            Err(e) => {
                tracing::info!(connection_id = %from, requested = %requested, error = %e, "Role refused");
                OutboundEvent::RoleResponse {
                    success: false,
                    role: requested,
                    message: Some(e.to_string()),
                }
            }
        };
        vec![Delivery::Reply(response)]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use laneclock_core::{Lane, ManualClock, LANE_COUNT};
    use serde_json::json;

    fn lane(n: u8) -> Lane {
        Lane::new(n).unwrap()
    }

    fn gateway_at(now: i64) -> (SessionGateway, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::new(now));
        (SessionGateway::new(clock.clone()), clock)
    }

    fn connect_as(gateway: &mut SessionGateway, role: &str) -> ConnectionId {
        let id = ConnectionId::new();
        let out = gateway.handle(&id, InboundEvent::RequestRole { role: role.into() });
        assert!(
            matches!(&out[..], [Delivery::Reply(OutboundEvent::RoleResponse { success: true, .. })]),
            "role {role} not granted: {out:?}"
        );
        id
    }

    #[test]
    fn role_request_replies_to_requester_only() {
        let (mut gateway, _) = gateway_at(0);
        let a = ConnectionId::new();
        let b = ConnectionId::new();

        gateway.handle(&a, InboundEvent::RequestRole { role: "admin".into() });
        let out = gateway.handle(&b, InboundEvent::RequestRole { role: "admin".into() });
        assert_eq!(
            out,
            vec![Delivery::Reply(OutboundEvent::RoleResponse {
                success: false,
                role: "admin".into(),
                message: Some("Role already taken".into()),
            })]
        );
    }

    #[test]
    fn unknown_role_is_refused() {
        let (mut gateway, _) = gateway_at(0);
        let out = gateway.handle(&ConnectionId::new(), InboundEvent::RequestRole { role: "lane-12".into() });
        assert!(matches!(
            &out[..],
            [Delivery::Reply(OutboundEvent::RoleResponse { success: false, message: Some(m), .. })] if m.contains("unknown role")
        ));
        assert!(gateway.roles().held_roles().is_empty());
    }

    #[test]
    fn unauthorized_commands_are_dropped() {
        let (mut gateway, _) = gateway_at(1_000);
        let nobody = ConnectionId::new();
        let lane_two = connect_as(&mut gateway, "lane-2");

        assert!(gateway.handle(&nobody, InboundEvent::StartTimer).is_empty());
        assert!(gateway.handle(&lane_two, InboundEvent::StartTimer).is_empty());
        assert!(!gateway.timer().is_active());

        let admin = connect_as(&mut gateway, "admin");
        gateway.handle(&admin, InboundEvent::StartTimer);

        // lane-2 may not stop lane 3, and admin may not use the lane stop path
        let stop3 = InboundEvent::StopTimer { lane: lane(3), client_stop_ms: None };
        assert!(gateway.handle(&lane_two, stop3.clone()).is_empty());
        assert!(gateway.handle(&admin, stop3).is_empty());
        assert!(gateway.handle(&lane_two, InboundEvent::ResetAllTimers).is_empty());
        assert_eq!(gateway.timer().lane_elapsed(lane(3)), None);
        assert!(gateway.timer().is_active());
    }

    #[test]
    fn unauthorized_attempt_is_logged_with_sender_role() {
        use laneclock_telemetry::{LogQuery, SqliteLogLayer, SqliteLogSink};
        use tracing_subscriber::layer::SubscriberExt;

        let sink = Arc::new(SqliteLogSink::new(std::path::Path::new(":memory:")).unwrap());
        let subscriber = tracing_subscriber::registry().with(SqliteLogLayer::new(sink.clone()));
        let (mut gateway, _) = gateway_at(1_000);
        let (lane_two, nobody) = tracing::subscriber::with_default(subscriber, || {
            let lane_two = connect_as(&mut gateway, "lane-2");
            let nobody = ConnectionId::new();
            gateway.handle(&lane_two, InboundEvent::StartTimer);
            gateway.handle(&nobody, InboundEvent::AdminStopLane { lane: lane(4) });
            (lane_two, nobody)
        });

        let by_role = sink
            .query(&LogQuery {
                role: Some("lane-2".into()),
                ..Default::default()
            })
            .unwrap();
        assert_eq!(by_role.len(), 1);
        let row = &by_role[0];
        assert_eq!(row.level, "WARN");
        assert_eq!(row.message, "Unauthorized attempt");
        assert_eq!(row.connection_id, Some(lane_two.to_string()));
        assert_eq!(row.event.as_deref(), Some("start-timer"));
        assert_eq!(row.fields, Some(json!({"required": "admin"})));

        let roleless = sink
            .query(&LogQuery {
                connection_id: Some(nobody.to_string()),
                ..Default::default()
            })
            .unwrap();
        assert_eq!(roleless.len(), 1);
        assert_eq!(roleless[0].role, None);
        assert_eq!(roleless[0].event.as_deref(), Some("admin-stop-lane"));
    }

    #[test]
    fn start_broadcasts_timestamp() {
        let (mut gateway, _) = gateway_at(1_000);
        let admin = connect_as(&mut gateway, "admin");
        assert_eq!(
            gateway.handle(&admin, InboundEvent::StartTimer),
            vec![Delivery::Broadcast(OutboundEvent::StartTimer { start_timestamp: 1_000 })]
        );
    }

    #[test]
    fn race_scenario() {
        let (mut gateway, clock) = gateway_at(1_000);
        let admin = connect_as(&mut gateway, "admin");
        let lane3 = connect_as(&mut gateway, "lane-3");
        gateway.handle(&admin, InboundEvent::StartTimer);

        let first = gateway.handle(&lane3, InboundEvent::StopTimer { lane: lane(3), client_stop_ms: Some(1_450.0) });
        assert_eq!(
            first,
            vec![
                Delivery::Broadcast(OutboundEvent::StopTimer {
                    lane_id: lane(3),
                    elapsed: 450,
                    source: ElapsedSource::Client,
                }),
                Delivery::Reply(OutboundEvent::StopAck { lane_id: lane(3), elapsed: 450 }),
            ]
        );

        let again = gateway.handle(&lane3, InboundEvent::StopTimer { lane: lane(3), client_stop_ms: Some(1_600.0) });
        assert_eq!(
            again,
            vec![Delivery::Reply(OutboundEvent::StopIgnored {
                lane_id: lane(3),
                elapsed: Some(450),
                reason: None,
            })]
        );

        clock.set(2_000);
        let overridden = gateway.handle(&admin, InboundEvent::AdminStopLane { lane: lane(3) });
        assert_eq!(
            overridden,
            vec![Delivery::Broadcast(OutboundEvent::StopTimer {
                lane_id: lane(3),
                elapsed: 1_000,
                source: ElapsedSource::Admin,
            })]
        );
        assert_eq!(gateway.timer().lane_elapsed(lane(3)), Some(1_000));
    }

    #[test]
    fn stop_without_race_broadcasts_unmeasured_zero() {
        let (mut gateway, _) = gateway_at(1_000);
        let lane5 = connect_as(&mut gateway, "lane-5");
        let out = gateway.handle(&lane5, InboundEvent::StopTimer { lane: lane(5), client_stop_ms: None });
        assert_eq!(
            out[0],
            Delivery::Broadcast(OutboundEvent::StopTimer {
                lane_id: lane(5),
                elapsed: 0,
                source: ElapsedSource::Unmeasured,
            })
        );
    }

    #[test]
    fn retried_stop_without_race_is_broadcast_again() {
        let (mut gateway, _) = gateway_at(1_000);
        let lane5 = connect_as(&mut gateway, "lane-5");
        let stop = InboundEvent::StopTimer { lane: lane(5), client_stop_ms: None };
        let expected = vec![
            Delivery::Broadcast(OutboundEvent::StopTimer {
                lane_id: lane(5),
                elapsed: 0,
                source: ElapsedSource::Unmeasured,
            }),
            Delivery::Reply(OutboundEvent::StopAck { lane_id: lane(5), elapsed: 0 }),
        ];

        assert_eq!(gateway.handle(&lane5, stop.clone()), expected);
        assert_eq!(gateway.handle(&lane5, stop), expected);
        assert_eq!(gateway.snapshot().lanes[4], None);
    }

    #[test]
    fn admin_actions_without_race_reply_no_active_race() {
        let (mut gateway, _) = gateway_at(1_000);
        let admin = connect_as(&mut gateway, "admin");
        assert_eq!(
            gateway.handle(&admin, InboundEvent::AdminStopLane { lane: lane(1) }),
            vec![Delivery::Reply(OutboundEvent::StopIgnored {
                lane_id: lane(1),
                elapsed: None,
                reason: Some("no_active_race"),
            })]
        );
        assert_eq!(
            gateway.handle(&admin, InboundEvent::StopAllTimers),
            vec![Delivery::Reply(OutboundEvent::StopAllIgnored { reason: "no_active_race" })]
        );
    }

    #[test]
    fn stop_all_and_reset() {
        let (mut gateway, clock) = gateway_at(1_000);
        let admin = connect_as(&mut gateway, "admin");
        let lane1 = connect_as(&mut gateway, "lane-1");
        gateway.handle(&admin, InboundEvent::StartTimer);
        gateway.handle(&lane1, InboundEvent::StopTimer { lane: lane(1), client_stop_ms: Some(1_250.0) });
        clock.set(3_000);

        let out = gateway.handle(&admin, InboundEvent::StopAllTimers);
        assert_eq!(
            out,
            vec![Delivery::Broadcast(OutboundEvent::StopAllTimers {
                elapsed: [250, 2_000, 2_000, 2_000, 2_000, 2_000, 2_000, 2_000],
            })]
        );

        assert_eq!(
            gateway.handle(&admin, InboundEvent::ResetAllTimers),
            vec![Delivery::Broadcast(OutboundEvent::ResetAllTimers)]
        );
        assert_eq!(gateway.timer().start_timestamp(), None);
        assert_eq!(gateway.timer().lanes(), [None; LANE_COUNT]);
    }

    #[test]
    fn resend_corrects_recorded_lane() {
        let (mut gateway, _) = gateway_at(1_000);
        let admin = connect_as(&mut gateway, "admin");
        let lane4 = connect_as(&mut gateway, "lane-4");
        gateway.handle(&admin, InboundEvent::StartTimer);

        assert_eq!(
            gateway.handle(&lane4, InboundEvent::ResendTimer { lane: lane(4), elapsed: 610.0 }),
            vec![Delivery::Reply(OutboundEvent::ResendRejected {
                lane_id: lane(4),
                reason: "lane_not_finalized",
            })]
        );

        gateway.handle(&lane4, InboundEvent::StopTimer { lane: lane(4), client_stop_ms: Some(1_600.0) });
        assert_eq!(
            gateway.handle(&lane4, InboundEvent::ResendTimer { lane: lane(4), elapsed: 610.0 }),
            vec![
                Delivery::Broadcast(OutboundEvent::ResendTimer {
                    lane_id: lane(4),
                    elapsed: 610,
                    source: ElapsedSource::Resend,
                }),
                Delivery::Reply(OutboundEvent::StopAck { lane_id: lane(4), elapsed: 610 }),
            ]
        );
        assert_eq!(gateway.timer().lane_elapsed(lane(4)), Some(610));
    }

    #[test]
    fn passthrough_needs_no_role() {
        let (mut gateway, _) = gateway_at(0);
        let anyone = ConnectionId::new();
        let payload = json!({"3": {"id": 17, "name": "Grace"}});
        assert_eq!(
            gateway.handle(&anyone, InboundEvent::AssignStudents(payload.clone())),
            vec![Delivery::Broadcast(OutboundEvent::AssignStudents(payload))]
        );
        assert_eq!(
            gateway.handle(&anyone, InboundEvent::ClearStudents),
            vec![Delivery::Broadcast(OutboundEvent::ClearStudents)]
        );
    }

    #[test]
    fn disconnect_frees_role_but_keeps_lane_time() {
        let (mut gateway, _) = gateway_at(1_000);
        let admin = connect_as(&mut gateway, "admin");
        let lane2 = connect_as(&mut gateway, "lane-2");
        gateway.handle(&admin, InboundEvent::StartTimer);
        gateway.handle(&lane2, InboundEvent::StopTimer { lane: lane(2), client_stop_ms: Some(1_333.0) });

        assert_eq!(gateway.disconnect(&lane2), Some(Role::Lane(lane(2))));
        assert_eq!(gateway.disconnect(&lane2), None);
        assert_eq!(gateway.timer().lane_elapsed(lane(2)), Some(333));

        connect_as(&mut gateway, "lane-2");
    }

    #[test]
    fn sync_state_replies_snapshot() {
        let (mut gateway, _) = gateway_at(5_000);
        let admin = connect_as(&mut gateway, "admin");
        gateway.handle(&admin, InboundEvent::StartTimer);

        let out = gateway.handle(&ConnectionId::new(), InboundEvent::SyncState);
        assert_eq!(
            out,
            vec![Delivery::Reply(OutboundEvent::State(SessionSnapshot {
                start_timestamp: Some(5_000),
                lanes: [None; LANE_COUNT],
                held_roles: vec![Role::Admin],
            }))]
        );
    }
}
