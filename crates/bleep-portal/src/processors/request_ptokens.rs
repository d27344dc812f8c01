use super::{
    accept_tx, accepted, check_external_proof, consume_external_tx, emit, expect_action, BuildEnv,
    ProcessEnv,
};
use crate::action::ActionEnvelope;
use crate::error::{BuildError, PortalError, RejectReason};
use crate::instruction::Instruction;
use crate::proof::{porting_memo, ExpectedPayment};
use crate::status::{write_status, RequestStatus, StatusScope};
use crate::tokens::TokenId;
use log::info;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequestPTokensContent {
    pub tx_id: String,
    pub porting_id: String,
    pub token_id: TokenId,
    pub amount: u64,
    pub requester: String,
    pub external_tx_id: String,
}

pub fn build(
    env: &mut BuildEnv<'_>,
    envelope: &ActionEnvelope,
    out: &mut Vec<Instruction>,
) -> Result<(), BuildError> {
    let (porting_id, token_id, amount, requester, proof) =
        expect_action!(envelope, RequestPTokens { porting_id, token_id, amount, requester, proof });

    let request = env
        .ctx
        .state
        .waiting_porting
        .get(porting_id)
        .cloned()
        .ok_or_else(|| RejectReason::RequestNotFound(porting_id.clone()))?;
    mismatch("token_id", request.token_id.as_str(), token_id.as_str())?;
    mismatch("amount", &request.amount.to_string(), &amount.to_string())?;
    mismatch("requester", &request.requester, requester)?;

    let chain = env
        .ctx
        .params
        .portal_token(token_id)
        .map(|config| config.chain)
        .ok_or_else(|| RejectReason::UnsupportedToken(token_id.clone()))?;
    let external_tx_id = check_external_proof(env, proof, chain)?;

    let expected: Vec<ExpectedPayment> = request
        .custodians
        .iter()
        .map(|c| ExpectedPayment {
            address: c.remote_address.clone(),
            token_id: request.token_id.clone(),
            amount: c.amount,
        })
        .collect();
    env.verifiers.verify(proof, &porting_memo(porting_id), &expected)?;

    let content = RequestPTokensContent {
        tx_id: envelope.tx_id.clone(),
        porting_id: porting_id.clone(),
        token_id: token_id.clone(),
        amount: *amount,
        requester: requester.clone(),
        external_tx_id,
    };
    emit(env, accepted(envelope, &content)?, out)?;
    Ok(())
}

fn mismatch(field: &'static str, expected: &str, actual: &str) -> Result<(), RejectReason> {
    if expected != actual {
        return Err(RejectReason::Mismatch {
            field,
            expected: expected.to_string(),
            actual: actual.to_string(),
        });
    }
    Ok(())
}

pub fn process(env: &mut ProcessEnv<'_>, inst: &Instruction) -> Result<(), PortalError> {
    let content: RequestPTokensContent = inst.decode()?;
    let request = env
        .state
        .waiting_porting
        .get(&content.porting_id)
        .cloned()
        .ok_or_else(|| PortalError::mismatch(inst.kind, format!("no waiting porting {}", content.porting_id)))?;
    if request.token_id != content.token_id
        || request.amount != content.amount
        || request.requester != content.requester
    {
        return Err(PortalError::mismatch(inst.kind, "request fields differ"));
    }
    consume_external_tx(env, &content.external_tx_id)?;

    for matched in &request.custodians {
        env.state
            .custodian_mut(&matched.custodian_address)?
            .add_holding(&request.token_id, matched.amount)?;
    }
    env.state.waiting_porting.remove(&content.porting_id);

    write_status(
        env.store,
        StatusScope::Porting,
        &content.porting_id,
        RequestStatus::Success,
        env.block.beacon_height,
        &inst.content,
    )?;
    info!(
        "[Portal] Porting {} completed: minted {} {}",
        content.porting_id, content.amount, content.token_id
    );
    accept_tx(env, &content.tx_id, inst)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::action::PortalAction;
    use crate::collateral::CollateralBundle;
    use crate::custodian::CustodianState;
    use crate::instruction::InstructionStatus;
    use crate::processors::test_support::Fixture;
    use crate::proof::{ExternalProof, ParsedReceipt, PassthroughVerifier};
    use crate::status::read_status;
    use crate::tokens::ExternalChain;

    fn pbtc() -> TokenId {
        TokenId::from("pbtc")
    }

    fn fixture() -> Fixture {
        let mut fx = Fixture::new();
        let mut c = CustodianState::new("c1");
        c.deposit_native(10_000).unwrap();
        c.remote_addresses.insert(pbtc(), "bc1-c1".to_string());
        fx.state.custodians.insert("c1".to_string(), c);
        fx.submit(ActionEnvelope::new(
            "tx-port",
            0,
            100,
            PortalAction::PortingRequest {
                porting_id: "p1".to_string(),
                token_id: pbtc(),
                amount: 100,
                requester: "user".to_string(),
                fee: 1,
            },
        ));
        fx
    }

    fn deposit_proof(memo: String, amount: u64) -> ExternalProof {
        let receipt = ParsedReceipt {
            memo,
            payments: vec![ExpectedPayment {
                address: "bc1-c1".to_string(),
                token_id: pbtc(),
                amount,
            }],
        };
        PassthroughVerifier::encode(ExternalChain::Bitcoin, "000000abc", 7, &receipt).unwrap()
    }

    fn request(tx: &str, amount: u64, proof: ExternalProof) -> ActionEnvelope {
        ActionEnvelope::new(
            tx,
            0,
            101,
            PortalAction::RequestPTokens {
                porting_id: "p1".to_string(),
                token_id: pbtc(),
                amount,
                requester: "user".to_string(),
                proof,
            },
        )
    }

    #[test]
    fn test_valid_proof_mints_holding() {
        let mut fx = fixture();
        let insts = fx.submit(request("tx1", 100, deposit_proof(porting_memo("p1"), 100)));
        assert_eq!(insts[0].status, InstructionStatus::Accepted);

        let c = &fx.state.custodians["c1"];
        assert_eq!(c.holding(&pbtc()), 100);
        // lock stays, now backing the holding
        assert_eq!(c.locked_for(&pbtc()), CollateralBundle::native(1_500));
        assert!(fx.state.waiting_porting.is_empty());
        let status = read_status(&fx.store, StatusScope::Porting, "p1").unwrap().unwrap();
        assert_eq!(status.status, RequestStatus::Success);
    }

    #[test]
    fn test_bad_requests_are_rejected() {
        let mut fx = fixture();
        let wrong_amount = fx.submit(request("tx1", 99, deposit_proof(porting_memo("p1"), 100)));
        assert_eq!(wrong_amount[0].status, InstructionStatus::Rejected);

        let wrong_memo = fx.submit(request("tx2", 100, deposit_proof(porting_memo("p2"), 100)));
        assert_eq!(wrong_memo[0].status, InstructionStatus::Rejected);

        let short_payment = fx.submit(request("tx3", 100, deposit_proof(porting_memo("p1"), 90)));
        assert_eq!(short_payment[0].status, InstructionStatus::Rejected);

        assert!(fx.state.waiting_porting.contains_key("p1"));
        assert_eq!(fx.state.custodians["c1"].holding(&pbtc()), 0);
    }

    #[test]
    fn test_second_claim_for_same_porting() {
        let mut fx = fixture();
        fx.submit(request("tx1", 100, deposit_proof(porting_memo("p1"), 100)));
        let again = fx.submit(request("tx2", 100, deposit_proof(porting_memo("p1"), 100)));
        assert_eq!(again[0].status, InstructionStatus::Rejected);
        assert_eq!(fx.state.custodians["c1"].holding(&pbtc()), 100);
    }
}
