/// PORTAL END-TO-END TESTS
///
/// These tests drive whole blocks through the control loop and verify:
/// - Porting expiry returns every lock
/// - A price rise liquidates back to the target ratio
/// - Producer and validator agree on the resulting state
/// - Replayed, malformed and forged blocks are rejected without side effects
/// - Collateral of every kind is conserved across random action sequences

#[cfg(test)]
mod portal_integration_tests {
    use bleep_portal::processors::expire_porting::ExpiredPortingContent;
    use bleep_portal::processors::liquidate_by_rates::LiquidateByRatesContent;
    use bleep_portal::*;
    use proptest::prelude::*;
    use std::collections::BTreeMap;

    fn pbtc() -> TokenId {
        TokenId::from("pbtc")
    }

    fn base_rates() -> FinalExchangeRates {
        FinalExchangeRates::new(0)
            .with_rate("prv", 1)
            .with_rate("pbtc", 10)
            .with_rate("usdt", 1)
    }

    struct Harness {
        engine: PortalEngine,
        store: MemoryStore,
        /// Fed the same blocks through verify_block
        validator: MemoryStore,
        rates: RateHistory,
        shard_height: u64,
        beacon_height: u64,
    }

    impl Harness {
        fn new() -> Self {
            let _ = env_logger::builder().is_test(true).try_init();
            let mut rates = RateHistory::new();
            rates.record(base_rates());
            Harness {
                engine: PortalEngine::new(PortalParams::default(), VerifierRegistry::passthrough()).unwrap(),
                store: MemoryStore::new(),
                validator: MemoryStore::new(),
                rates,
                shard_height: 10,
                beacon_height: 0,
            }
        }

        fn next_block(&mut self, shard_blocks: u64) -> BlockContext {
            self.beacon_height += 1;
            self.shard_height += shard_blocks;
            BlockContext::new(self.beacon_height).with_shard_height(0, self.shard_height)
        }

        /// Build, process, and check producer/validator agreement
        fn run(&mut self, shard_blocks: u64, actions: &[ActionEnvelope]) -> Vec<Instruction> {
            let block = self.next_block(shard_blocks);
            let output = self
                .engine
                .build_block(&block, &self.store, &self.rates, actions)
                .unwrap();
            let fingerprint = self
                .engine
                .process_block(&block, &mut self.store, &self.rates, &output.instructions)
                .unwrap();
            assert_eq!(fingerprint, output.state_fingerprint);
            let verified = self
                .engine
                .verify_block(&block, &mut self.validator, &self.rates, actions, &output.instructions)
                .unwrap();
            assert_eq!(verified, fingerprint);
            output.instructions
        }

        fn state(&self) -> PortalState {
            self.engine.load_state(&self.store).unwrap()
        }

        fn envelope(&self, tx: &str, action: PortalAction) -> ActionEnvelope {
            ActionEnvelope::new(tx, 0, self.shard_height, action)
        }
    }

    fn deposit(custodian: &str, amount: u64) -> PortalAction {
        let mut remote_addresses = BTreeMap::new();
        remote_addresses.insert(pbtc(), format!("bc1-{}", custodian));
        PortalAction::CustodianDeposit {
            custodian: custodian.to_string(),
            amount,
            remote_addresses,
        }
    }

    fn porting(id: &str, amount: u64) -> PortalAction {
        PortalAction::PortingRequest {
            porting_id: id.to_string(),
            token_id: pbtc(),
            amount,
            requester: "user".to_string(),
            fee: 1,
        }
    }

    fn ptokens_proof(porting_id: &str, custodian: &str, amount: u64) -> ExternalProof {
        let receipt = ParsedReceipt {
            memo: porting_memo(porting_id),
            payments: vec![ExpectedPayment {
                address: format!("bc1-{}", custodian),
                token_id: pbtc(),
                amount,
            }],
        };
        PassthroughVerifier::encode(ExternalChain::Bitcoin, "00000000feed", 1, &receipt).unwrap()
    }

    fn kinds(insts: &[Instruction]) -> Vec<InstructionKind> {
        insts.iter().map(|i| i.kind).collect()
    }

    #[test]
    fn test_porting_expiry_returns_collateral() {
        let mut h = Harness::new();
        let deposit_tx = h.envelope("tx-deposit", deposit("c1", 10_000));
        h.run(1, &[deposit_tx]);

        let port_tx = h.envelope("tx-port", porting("p1", 100));
        let insts = h.run(1, &[port_tx]);
        assert_eq!(kinds(&insts), vec![InstructionKind::PortingRequest, InstructionKind::Reward]);

        let state = h.state();
        let c1 = &state.custodians["c1"];
        assert_eq!(c1.total_collateral, 10_000);
        assert_eq!(c1.free_collateral, 8_500);
        assert_eq!(c1.locked_for(&pbtc()), CollateralBundle::native(1_500));
        // fee 1 plus block reward 1000, all to the only locking custodian
        assert_eq!(c1.reward_balance, 1_001);

        let insts = h.run(101, &[]);
        assert_eq!(kinds(&insts), vec![InstructionKind::ExpiredPorting]);
        assert_eq!(insts[0].status, InstructionStatus::Expired);
        assert_eq!(insts[0].shard_id, AUTO_SHARD_ID);

        let state = h.state();
        let c1 = &state.custodians["c1"];
        assert_eq!(c1.free_collateral, 10_000);
        assert!(c1.locked_collateral.is_empty());
        assert!(state.waiting_porting.is_empty());
        let status = read_status(&h.store, StatusScope::Porting, "p1").unwrap().unwrap();
        assert_eq!(status.status, RequestStatus::Expired);
    }

    #[test]
    fn test_price_rise_liquidates_to_target_ratio() {
        let mut h = Harness::new();
        let deposit_tx = h.envelope("tx-deposit", deposit("c1", 10_000));
        h.run(1, &[deposit_tx]);
        let port_tx = h.envelope("tx-port", porting("p1", 100));
        h.run(1, &[port_tx]);
        let claim_tx = h.envelope(
            "tx-ptokens",
            PortalAction::RequestPTokens {
                porting_id: "p1".to_string(),
                token_id: pbtc(),
                amount: 100,
                requester: "user".to_string(),
                proof: ptokens_proof("p1", "c1", 100),
            },
        );
        h.run(1, &[claim_tx]);
        assert_eq!(h.state().custodians["c1"].holding(&pbtc()), 100);

        h.rates.record(base_rates().with_rate("pbtc", 12).final_rates(4).unwrap());
        let insts = h.run(1, &[]);
        assert_eq!(insts[0].kind, InstructionKind::LiquidateByRates);

        let state = h.state();
        let c1 = &state.custodians["c1"];
        assert_eq!(c1.holding(&pbtc()), 44);
        assert_eq!(c1.locked_for(&pbtc()), CollateralBundle::native(794));
        assert_eq!(c1.total_collateral, 10_000 - 706);
        let pool = state.liquidation_pool.entry(&pbtc()).unwrap();
        assert_eq!(pool.public_token_amount, 56);
        assert_eq!(pool.collateral, CollateralBundle::native(706));
        // 794 * 100 / (44 * 12) = 150
        assert!(liquidation::collateral_ratio(794, 44, 12).unwrap() >= 150);

        // the pool pays pToken holders pro rata
        let redeem_tx = h.envelope(
            "tx-pool",
            PortalAction::RedeemFromLiquidationPool {
                token_id: pbtc(),
                amount: 28,
                redeemer: "holder".to_string(),
            },
        );
        h.run(1, &[redeem_tx]);
        assert_eq!(h.state().liquidation_pool.entry(&pbtc()).unwrap().public_token_amount, 28);
    }

    #[test]
    fn test_redeem_paid_out_in_full() {
        let mut h = Harness::new();
        let deposit_tx = h.envelope("tx-deposit", deposit("c1", 10_000));
        h.run(1, &[deposit_tx]);
        let port_tx = h.envelope("tx-port", porting("p1", 100));
        h.run(1, &[port_tx]);
        let claim_tx = h.envelope(
            "tx-ptokens",
            PortalAction::RequestPTokens {
                porting_id: "p1".to_string(),
                token_id: pbtc(),
                amount: 100,
                requester: "user".to_string(),
                proof: ptokens_proof("p1", "c1", 100),
            },
        );
        h.run(1, &[claim_tx]);

        let redeem = h.envelope(
            "tx-redeem",
            PortalAction::RedeemRequest {
                redeem_id: "r1".to_string(),
                token_id: pbtc(),
                amount: 100,
                redeemer: "user".to_string(),
                remote_address: "bc1-user".to_string(),
                fee: 1,
            },
        );
        let matching = h.envelope(
            "tx-match",
            PortalAction::RequestMatchingRedeem {
                redeem_id: "r1".to_string(),
                custodian: "c1".to_string(),
            },
        );
        // both in one block: redeem is built before matching
        h.run(1, &[matching, redeem]);
        assert!(h.state().matched_redeems.contains_key("r1"));

        let payout = ParsedReceipt {
            memo: redeem_memo("r1"),
            payments: vec![ExpectedPayment {
                address: "bc1-user".to_string(),
                token_id: pbtc(),
                amount: 100,
            }],
        };
        let unlock = h.envelope(
            "tx-unlock",
            PortalAction::RequestUnlockCollateral {
                redeem_id: "r1".to_string(),
                token_id: pbtc(),
                custodian: "c1".to_string(),
                amount: 100,
                proof: PassthroughVerifier::encode(ExternalChain::Bitcoin, "00000000beef", 2, &payout).unwrap(),
            },
        );
        h.run(1, &[unlock]);

        let state = h.state();
        let c1 = &state.custodians["c1"];
        assert_eq!(c1.holding(&pbtc()), 0);
        assert_eq!(c1.free_collateral, 10_000);
        assert!(state.matched_redeems.is_empty());
        let status = read_status(&h.store, StatusScope::Redeem, "r1").unwrap().unwrap();
        assert_eq!(status.status, RequestStatus::Success);
    }

    #[test]
    fn test_build_is_deterministic() {
        let mut h = Harness::new();
        let setup = [
            h.envelope("tx-a", deposit("a", 5_000)),
            h.envelope("tx-b", deposit("b", 7_000)),
        ];
        h.run(1, &setup);

        let block = h.next_block(1);
        let actions = vec![
            h.envelope("tx-2", porting("p2", 50)),
            h.envelope("tx-1", porting("p1", 100)),
            h.envelope("tx-bad", porting("p3", 0)),
        ];
        let mut reversed = actions.clone();
        reversed.reverse();

        let first = h.engine.build_block(&block, &h.store, &h.rates, &actions).unwrap();
        let second = h.engine.build_block(&block, &h.store, &h.rates, &reversed).unwrap();
        assert_eq!(first, second);
        assert_eq!(first.instructions[0].content, second.instructions[0].content);
        let statuses: Vec<_> = first.instructions.iter().map(|i| i.status).collect();
        assert!(statuses.contains(&InstructionStatus::Rejected));
    }

    #[test]
    fn test_replayed_block_is_rejected_without_side_effects() {
        let mut h = Harness::new();
        let deposit_tx = h.envelope("tx-deposit", deposit("c1", 10_000));
        h.run(1, &[deposit_tx]);

        let block = h.next_block(1);
        let port_tx = h.envelope("tx-port", porting("p1", 100));
        let output = h.engine.build_block(&block, &h.store, &h.rates, &[port_tx.clone()]).unwrap();
        h.engine
            .process_block(&block, &mut h.store, &h.rates, &output.instructions)
            .unwrap();
        let committed = h.store.clone();

        assert!(h
            .engine
            .process_block(&block, &mut h.store, &h.rates, &output.instructions)
            .is_err());
        assert_eq!(h.store, committed);

        // the same tx forwarded again is skipped, not rejected
        let later = h.next_block(1);
        let again = h.engine.build_block(&later, &h.store, &h.rates, &[port_tx]).unwrap();
        assert!(again
            .instructions
            .iter()
            .all(|i| i.kind != InstructionKind::PortingRequest));
    }

    #[test]
    fn test_tampered_and_malformed_blocks() {
        let mut h = Harness::new();
        let block = h.next_block(1);
        let deposit_tx = h.envelope("tx-deposit", deposit("c1", 10_000));
        let output = h.engine.build_block(&block, &h.store, &h.rates, &[deposit_tx]).unwrap();

        let mut record = output.instructions[0].to_record();
        record[3] = record[3].replace("10000", "99999");
        let tampered = Instruction::from_record(&record).unwrap();
        let fingerprint = h
            .engine
            .process_block(&block, &mut h.store, &h.rates, &[tampered])
            .unwrap();
        // a validator accepts it but lands on a different state
        assert_ne!(fingerprint, output.state_fingerprint);

        let mut h2 = Harness::new();
        let block = h2.next_block(1);
        let garbage = Instruction {
            kind: InstructionKind::RequestPTokens,
            shard_id: 0,
            status: InstructionStatus::Accepted,
            content: "{}".to_string(),
        };
        assert!(h2
            .engine
            .process_block(&block, &mut h2.store, &h2.rates, &[garbage])
            .is_err());
        assert!(h2.store.is_empty());
    }

    #[test]
    fn test_early_expiry_block_is_rejected() {
        let mut h = Harness::new();
        let deposit_tx = h.envelope("tx-deposit", deposit("c1", 10_000));
        h.run(1, &[deposit_tx]);
        let port_tx = h.envelope("tx-port", porting("p1", 100));
        h.run(1, &[port_tx]);
        let custodians = h.state().waiting_porting["p1"].custodians.clone();
        let committed = h.store.clone();

        // one shard block into a 100 block timeout
        let block = h.next_block(1);
        let forged = Instruction::auto(
            InstructionKind::ExpiredPorting,
            InstructionStatus::Expired,
            &ExpiredPortingContent {
                porting_id: "p1".to_string(),
                token_id: pbtc(),
                by_liquidation: false,
                custodians,
            },
        )
        .unwrap();
        let err = h
            .engine
            .process_block(&block, &mut h.store, &h.rates, &[forged])
            .unwrap_err();
        assert!(matches!(err, PortalError::InstructionMismatch { .. }));
        assert_eq!(h.store, committed);
        assert_eq!(h.state().custodians["c1"].free_collateral, 8_500);
    }

    #[test]
    fn test_healthy_custodian_liquidation_block_is_rejected() {
        let mut h = Harness::new();
        let deposit_tx = h.envelope("tx-deposit", deposit("c1", 10_000));
        h.run(1, &[deposit_tx]);
        let port_tx = h.envelope("tx-port", porting("p1", 100));
        h.run(1, &[port_tx]);
        let claim_tx = h.envelope(
            "tx-ptokens",
            PortalAction::RequestPTokens {
                porting_id: "p1".to_string(),
                token_id: pbtc(),
                amount: 100,
                requester: "user".to_string(),
                proof: ptokens_proof("p1", "c1", 100),
            },
        );
        h.run(1, &[claim_tx]);
        let committed = h.store.clone();

        // 1500 locked for 100 pbtc at 10 is a 150% ratio
        let block = h.next_block(1);
        let forged = Instruction::auto(
            InstructionKind::LiquidateByRates,
            InstructionStatus::Liquidated,
            &LiquidateByRatesContent {
                custodian: "c1".to_string(),
                token_id: pbtc(),
                holding: 100,
                ratio_percent: 100,
                liquidated_amount: 100,
                seized: CollateralBundle::native(1_500),
                cancelled_matches: Vec::new(),
            },
        )
        .unwrap();
        let err = h
            .engine
            .process_block(&block, &mut h.store, &h.rates, &[forged.clone()])
            .unwrap_err();
        assert!(matches!(err, PortalError::InstructionMismatch { .. }));
        assert_eq!(h.store, committed);

        // a rebuild from the same inputs has nothing to liquidate
        let err = h
            .engine
            .verify_block(&block, &mut h.store, &h.rates, &[], &[forged])
            .unwrap_err();
        assert!(matches!(err, PortalError::BlockMismatch { .. }));
        assert_eq!(h.store, committed);
        assert_eq!(h.state().custodians["c1"].holding(&pbtc()), 100);
    }

    fn usdt() -> TokenId {
        TokenId::from("usdt")
    }

    /// Comfortably above the minimum porting and redeem fee
    fn fee_for(amount: u64) -> u64 {
        amount / 100 + 1
    }

    fn token_topup(custodian: &str, amount: u64, block_hash: &str) -> PortalAction {
        let receipt = ParsedReceipt {
            memo: topup_memo(custodian),
            payments: vec![ExpectedPayment {
                address: "0x0000000000000000000000000000000000ba17".to_string(),
                token_id: usdt(),
                amount,
            }],
        };
        PortalAction::CustodianTopup {
            custodian: custodian.to_string(),
            collateral: CollateralKind::Token(usdt()),
            amount,
            proof: Some(PassthroughVerifier::encode(ExternalChain::Ethereum, block_hash, 0, &receipt).unwrap()),
        }
    }

    /// Claim the oldest waiting porting, paying every backing custodian
    fn claim_ptokens(state: &PortalState, block_hash: &str) -> Option<PortalAction> {
        let request = state.waiting_porting.values().next()?;
        let receipt = ParsedReceipt {
            memo: porting_memo(&request.porting_id),
            payments: request
                .custodians
                .iter()
                .map(|c| ExpectedPayment {
                    address: c.remote_address.clone(),
                    token_id: request.token_id.clone(),
                    amount: c.amount,
                })
                .collect(),
        };
        Some(PortalAction::RequestPTokens {
            porting_id: request.porting_id.clone(),
            token_id: request.token_id.clone(),
            amount: request.amount,
            requester: request.requester.clone(),
            proof: PassthroughVerifier::encode(ExternalChain::Bitcoin, block_hash, 0, &receipt).unwrap(),
        })
    }

    /// Every match of the oldest matched redeem pays the redeemer
    fn unlock_all(state: &PortalState, block_hash: &str) -> Vec<PortalAction> {
        let request = match state.matched_redeems.values().next() {
            Some(request) => request,
            None => return Vec::new(),
        };
        request
            .custodians
            .iter()
            .enumerate()
            .map(|(index, matched)| {
                let receipt = ParsedReceipt {
                    memo: redeem_memo(&request.redeem_id),
                    payments: vec![ExpectedPayment {
                        address: request.redeemer_remote_address.clone(),
                        token_id: request.token_id.clone(),
                        amount: matched.amount,
                    }],
                };
                PortalAction::RequestUnlockCollateral {
                    redeem_id: request.redeem_id.clone(),
                    token_id: request.token_id.clone(),
                    custodian: matched.custodian_address.clone(),
                    amount: matched.amount,
                    proof: PassthroughVerifier::encode(ExternalChain::Bitcoin, block_hash, index as u32, &receipt)
                        .unwrap(),
                }
            })
            .collect()
    }

    #[derive(Debug, Clone)]
    enum Op {
        Deposit(usize, u64),
        TokenTopup(usize, u64),
        Porting(u64),
        ClaimPTokens,
        Withdraw(usize, u64),
        TokenWithdraw(usize, u64),
        /// Redeem request plus a matching request from every custodian
        Redeem(u64),
        Unlock,
        PriceMove(u64),
        Expire,
        RunAway,
    }

    fn op_strategy() -> impl Strategy<Value = Op> {
        prop_oneof![
            (0usize..3, 1u64..50_000).prop_map(|(c, a)| Op::Deposit(c, a)),
            (0usize..3, 1u64..20_000).prop_map(|(c, a)| Op::TokenTopup(c, a)),
            (1u64..2_000).prop_map(Op::Porting),
            Just(Op::ClaimPTokens),
            (0usize..3, 1u64..20_000).prop_map(|(c, a)| Op::Withdraw(c, a)),
            (0usize..3, 1u64..10_000).prop_map(|(c, a)| Op::TokenWithdraw(c, a)),
            (1u64..300).prop_map(Op::Redeem),
            Just(Op::Unlock),
            (6u64..20).prop_map(Op::PriceMove),
            Just(Op::Expire),
            Just(Op::RunAway),
        ]
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(32))]

        #[test]
        fn prop_collateral_is_conserved(ops in prop::collection::vec(op_strategy(), 1..32)) {
            let mut h = Harness::new();
            let custodians = ["a", "b", "c"];
            // net deposits per collateral kind
            let mut native_in: u64 = 0;
            let mut native_out: u64 = 0;
            let mut usdt_in: u64 = 0;
            let mut usdt_out: u64 = 0;

            for (i, op) in ops.iter().enumerate() {
                let tx = format!("tx-{}", i);
                let block_hash = format!("0000{:08}", i);
                let (shard_blocks, actions) = match op {
                    Op::Deposit(c, amount) => (1, vec![h.envelope(&tx, deposit(custodians[*c], *amount))]),
                    Op::TokenTopup(c, amount) => (
                        1,
                        vec![h.envelope(&tx, token_topup(custodians[*c], *amount, &block_hash))],
                    ),
                    Op::Porting(amount) => (
                        1,
                        vec![h.envelope(&tx, PortalAction::PortingRequest {
                            porting_id: format!("p{}", i),
                            token_id: pbtc(),
                            amount: *amount,
                            requester: "user".to_string(),
                            fee: fee_for(*amount),
                        })],
                    ),
                    Op::ClaimPTokens => {
                        let actions = claim_ptokens(&h.state(), &block_hash)
                            .map(|action| vec![h.envelope(&tx, action)])
                            .unwrap_or_default();
                        (1, actions)
                    }
                    Op::Withdraw(c, amount) => (
                        1,
                        vec![h.envelope(&tx, PortalAction::WithdrawCollateral {
                            custodian: custodians[*c].to_string(),
                            collateral: CollateralKind::Native,
                            amount: *amount,
                            external_address: None,
                        })],
                    ),
                    Op::TokenWithdraw(c, amount) => (
                        1,
                        vec![h.envelope(&tx, PortalAction::WithdrawCollateral {
                            custodian: custodians[*c].to_string(),
                            collateral: CollateralKind::Token(usdt()),
                            amount: *amount,
                            external_address: Some("0x000000000000000000000000000000000000c0de".to_string()),
                        })],
                    ),
                    Op::Redeem(amount) => {
                        let redeem_id = format!("r{}", i);
                        let mut actions = vec![h.envelope(&tx, PortalAction::RedeemRequest {
                            redeem_id: redeem_id.clone(),
                            token_id: pbtc(),
                            amount: *amount,
                            redeemer: "user".to_string(),
                            remote_address: "bc1-user".to_string(),
                            fee: fee_for(*amount),
                        })];
                        for custodian in custodians {
                            actions.push(h.envelope(
                                &format!("{}-{}", tx, custodian),
                                PortalAction::RequestMatchingRedeem {
                                    redeem_id: redeem_id.clone(),
                                    custodian: custodian.to_string(),
                                },
                            ));
                        }
                        (1, actions)
                    }
                    Op::Unlock => {
                        let actions = unlock_all(&h.state(), &block_hash)
                            .into_iter()
                            .enumerate()
                            .map(|(k, action)| h.envelope(&format!("{}-{}", tx, k), action))
                            .collect();
                        (1, actions)
                    }
                    Op::PriceMove(price) => {
                        let next = h.beacon_height + 1;
                        h.rates.record(base_rates().with_rate("pbtc", *price).final_rates(next).unwrap());
                        (1, Vec::new())
                    }
                    Op::Expire => (150, Vec::new()),
                    Op::RunAway => (250, Vec::new()),
                };
                let insts = h.run(shard_blocks, &actions);

                for inst in insts.iter().filter(|i| i.status == InstructionStatus::Accepted) {
                    match (op, inst.kind) {
                        (Op::Deposit(_, amount), InstructionKind::CustodianDeposit) => native_in += amount,
                        (Op::TokenTopup(_, amount), InstructionKind::CustodianTopup) => usdt_in += amount,
                        (Op::Withdraw(_, amount), InstructionKind::WithdrawCollateral) => native_out += amount,
                        (Op::TokenWithdraw(_, amount), InstructionKind::WithdrawCollateral) => usdt_out += amount,
                        _ => {}
                    }
                }

                let state = h.state();
                state.verify_invariants().unwrap();
                let mut native_held: u64 = 0;
                let mut usdt_held: u64 = 0;
                for custodian in state.custodians.values() {
                    let locked = custodian.total_locked().unwrap();
                    prop_assert_eq!(custodian.free_collateral + locked.native, custodian.total_collateral);
                    for (token, total) in &custodian.total_token_collaterals {
                        let free = custodian.free_token_collaterals.get(token).copied().unwrap_or(0);
                        let locked = locked.tokens.get(token).copied().unwrap_or(0);
                        prop_assert_eq!(free + locked, *total);
                    }
                    for token in locked.tokens.keys() {
                        prop_assert!(custodian.total_token_collaterals.contains_key(token));
                    }
                    native_held += custodian.total_collateral;
                    usdt_held += custodian.total_token_collaterals.get(&usdt()).copied().unwrap_or(0);
                }

                let pooled = state.liquidation_pool.total_collateral().unwrap();
                prop_assert_eq!(native_held + pooled.native, native_in - native_out);
                prop_assert_eq!(
                    usdt_held + pooled.tokens.get(&usdt()).copied().unwrap_or(0),
                    usdt_in - usdt_out
                );
                for request in state.waiting_porting.values() {
                    prop_assert_eq!(request.total_allocated().unwrap(), request.amount);
                }
            }
        }
    }
}
