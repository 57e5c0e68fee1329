use crate::{
    codec,
    protocol::frame::{
        asdu::{AppLayerParameters, Asdu, AsduBuilder, Cause, CauseOfTransmission, CommonAddr},
        csys::qoi_group,
    },
    registry::PointRegistry,
    transport::MasterConnection,
};
use std::sync::Arc;
use tracing::{debug, error, warn};

/// Answers station and group interrogations (C_IC_NA_1).
pub struct InterrogationResponder {
    registry: Arc<PointRegistry>,
    params: AppLayerParameters,
}

impl InterrogationResponder {
    pub fn new(registry: Arc<PointRegistry>, params: AppLayerParameters) -> Self {
        Self { registry, params }
    }

    /// Handles one interrogation request. Always returns true, every outcome is
    /// answered on `conn`.
    pub fn respond(&self, conn: &dyn MasterConnection, request: &Asdu) -> bool {
        if request.cause() != Cause::Activation {
            warn!(cause = ?request.cause(), "Interrogation with unexpected cause");
            send(conn, negative(request, Cause::UnknownCOT));
            return true;
        }

        let qoi = match request.get_interrogation_cmd(&self.params) {
            Ok((_, qoi)) => qoi,
            Err(e) => {
                warn!("Malformed interrogation request: {e}");
                send(conn, negative(request, Cause::ActivationCon));
                return true;
            }
        };
        let Some(group) = qoi_group(qoi) else {
            warn!(qoi, "Unsupported qualifier of interrogation");
            send(conn, negative(request, Cause::ActivationCon));
            return true;
        };

        let ca = request.common_addr();
        let targets = if ca == self.params.global_common_addr() {
            self.registry.common_addresses()
        } else if self.registry.has_ca(ca) {
            vec![ca]
        } else {
            Vec::new()
        };
        if targets.is_empty() {
            warn!(ca, "Interrogation for unknown common address");
            send(conn, negative(request, Cause::UnknownCA));
            return true;
        }

        for target in targets {
            let mut req = request.clone();
            req.identifier.common_addr = target;
            self.respond_ca(conn, &req, group);
        }
        true
    }

    fn respond_ca(&self, conn: &dyn MasterConnection, request: &Asdu, group: u8) {
        let ca: CommonAddr = request.common_addr();
        if let Err(e) = conn.send_act_con(request, false) {
            error!(ca, "Failed to confirm interrogation: {e}");
            return;
        }

        let Some(cause) = Cause::interrogated_by(group) else {
            return;
        };
        let mut cot = CauseOfTransmission::from_cause(cause);
        cot.test().set(request.is_test());

        let mut builder: Option<AsduBuilder> = None;
        let mut sent = 0usize;
        for point in self.registry.monitoring_points(ca, group) {
            let type_id = point.kind.monitoring_type(false);
            let obj = match codec::encode(&point, type_id, &self.params) {
                Ok(obj) => obj,
                Err(e) => {
                    warn!(label = %point.label, ca, ioa = point.ioa, "Point skipped: {e}");
                    continue;
                }
            };

            if builder.as_ref().is_some_and(|b| b.type_id() != type_id) {
                if let Some(mut b) = builder.take() {
                    sent += flush(conn, &mut b);
                }
            }
            let b = builder.get_or_insert_with(|| {
                AsduBuilder::new(type_id, cot, request.orig_addr(), ca, self.params)
            });
            if !b.push(&obj) {
                sent += flush(conn, b);
                if !b.push(&obj) {
                    warn!(label = %point.label, ca, ioa = point.ioa, "Point does not fit an asdu");
                }
            }
        }
        if let Some(mut b) = builder {
            sent += flush(conn, &mut b);
        }
        debug!(ca, group, asdus = sent, "Interrogation answered");

        if let Err(e) = conn.send_act_term(request) {
            error!(ca, "Failed to terminate interrogation: {e}");
        }
    }
}

fn negative(request: &Asdu, cause: Cause) -> Asdu {
    let mut resp = request.mirror(cause);
    resp.set_negative(true);
    resp
}

fn send(conn: &dyn MasterConnection, asdu: Asdu) {
    if let Err(e) = conn.send_asdu(asdu) {
        error!(connection = conn.id(), "Failed to send asdu: {e}");
    }
}

/// Sends what the builder holds. Returns the number of ASDUs sent.
fn flush(conn: &dyn MasterConnection, builder: &mut AsduBuilder) -> usize {
    if builder.is_empty() {
        return 0;
    }
    send(conn, builder.take());
    1
}
