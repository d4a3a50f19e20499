use std::str::FromStr;
use std::sync::Arc;

use async_trait::async_trait;
use cosmrs::bank::MsgSend;
use cosmrs::cosmwasm::MsgExecuteContract;
use cosmrs::crypto::secp256k1::SigningKey;
use cosmrs::crypto::PublicKey;
use cosmrs::proto::cosmos::auth::v1beta1::query_client::QueryClient as AuthQueryClient;
use cosmrs::proto::cosmos::auth::v1beta1::{BaseAccount, QueryAccountRequest};
use cosmrs::proto::cosmos::bank::v1beta1::query_client::QueryClient as BankQueryClient;
use cosmrs::proto::cosmos::bank::v1beta1::QueryBalanceRequest;
use cosmrs::proto::cosmos::base::tendermint::v1beta1::service_client::ServiceClient as TendermintServiceClient;
use cosmrs::proto::cosmos::base::tendermint::v1beta1::GetNodeInfoRequest;
use cosmrs::proto::cosmos::tx::v1beta1::service_client::ServiceClient as TxServiceClient;
use cosmrs::proto::cosmos::tx::v1beta1::{BroadcastMode, BroadcastTxRequest, GetTxRequest};
use cosmrs::proto::cosmwasm::wasm::v1::query_client::QueryClient as WasmQueryClient;
use cosmrs::proto::cosmwasm::wasm::v1::QuerySmartContractStateRequest;
use cosmrs::proto::traits::Message;
use cosmrs::tendermint::chain::Id as ChainId;
use cosmrs::tx::{Body, Fee, Msg, SignDoc, SignerInfo};
use cosmrs::{AccountId, Any};
use tonic::transport::{Channel, Endpoint};
use tracing::{debug, info};

use super::{ChainClient, ChainConnector, ChainError, Coin, GasFee, TxResult};
use crate::config::ChainConfig;
use crate::utils::amount::parse_base_amount;

/// BIP-44 path for the Cosmos coin type.
const DERIVATION_PATH: &str = "m/44'/118'/0'/0/0";

/// Signing chain client speaking the CosmWasm/Stargate gRPC dialect.
///
/// Holds two channels: one for signing/broadcast traffic and a read-only
/// one for transaction lookups and queries.
pub struct GrpcChain {
    signing_key: SigningKey,
    public_key: PublicKey,
    account_id: AccountId,
    address: String,
    account_number: u64,
    chain_id: ChainId,
    channel: Channel,
    query_channel: Channel,
}

impl GrpcChain {
    pub async fn connect(config: &ChainConfig) -> Result<Self, ChainError> {
        let signing_key = derive_key(&config.wallet_mnemonic)?;
        let public_key = signing_key.public_key();
        let account_id = public_key.account_id(&config.address_prefix)?;
        let address = account_id.to_string();

        let channel = Endpoint::from_shared(config.rpc_host.clone())?
            .connect()
            .await?;
        let query_channel = Endpoint::from_shared(config.rpc_host.clone())?
            .connect()
            .await?;

        let node_info = TendermintServiceClient::new(query_channel.clone())
            .get_node_info(GetNodeInfoRequest {})
            .await?
            .into_inner();
        let network = node_info
            .default_node_info
            .map(|info| info.network)
            .unwrap_or_default();
        let chain_id =
            ChainId::try_from(network.clone()).map_err(|err| ChainError::ChainId(err.to_string()))?;

        let account = query_base_account(channel.clone(), &address).await?;

        info!(%address, chain = %network, "Connected wallet to chain");

        Ok(Self {
            signing_key,
            public_key,
            account_id,
            address,
            account_number: account.account_number,
            chain_id,
            channel,
            query_channel,
        })
    }

    async fn sign_and_broadcast(
        &self,
        msg: Any,
        fee: &GasFee,
        sequence: u64,
    ) -> Result<String, ChainError> {
        let body = Body::new(vec![msg], "", 0u32);
        let fee = Fee::from_amount_and_gas(to_cosm_coin(&fee.amount)?, fee.gas_limit);
        let auth_info =
            SignerInfo::single_direct(Some(self.public_key.clone()), sequence).auth_info(fee);
        let sign_doc = SignDoc::new(&body, &auth_info, &self.chain_id, self.account_number)?;
        let tx_bytes = sign_doc.sign(&self.signing_key)?.to_bytes()?;

        let response = TxServiceClient::new(self.channel.clone())
            .broadcast_tx(BroadcastTxRequest {
                tx_bytes,
                mode: BroadcastMode::Sync.into(),
            })
            .await?
            .into_inner()
            .tx_response
            .ok_or(ChainError::MissingAccount)?;

        if response.code != 0 {
            return Err(ChainError::Broadcast {
                code: response.code,
                log: response.raw_log,
            });
        }

        debug!(hash = %response.txhash, "Broadcast accepted");

        Ok(response.txhash)
    }
}

#[async_trait]
impl ChainClient for GrpcChain {
    fn address(&self) -> &str {
        &self.address
    }

    async fn account_sequence(&self) -> Result<u64, ChainError> {
        let account = query_base_account(self.channel.clone(), &self.address).await?;
        Ok(account.sequence)
    }

    async fn native_balance(&self, address: &str, denom: &str) -> Result<u128, ChainError> {
        let response = BankQueryClient::new(self.query_channel.clone())
            .balance(QueryBalanceRequest {
                address: address.to_owned(),
                denom: denom.to_owned(),
            })
            .await?
            .into_inner();

        match response.balance {
            Some(coin) => Ok(parse_base_amount(&coin.amount)?),
            None => Ok(0),
        }
    }

    async fn query_contract_smart(
        &self,
        contract: &str,
        query: &serde_json::Value,
    ) -> Result<serde_json::Value, ChainError> {
        let response = WasmQueryClient::new(self.query_channel.clone())
            .smart_contract_state(QuerySmartContractStateRequest {
                address: contract.to_owned(),
                query_data: serde_json::to_vec(query)?,
            })
            .await?
            .into_inner();

        Ok(serde_json::from_slice(&response.data)?)
    }

    async fn bank_send(
        &self,
        recipient: &str,
        coin: Coin,
        fee: &GasFee,
        sequence: u64,
    ) -> Result<String, ChainError> {
        let msg = MsgSend {
            from_address: self.account_id.clone(),
            to_address: AccountId::from_str(recipient)?,
            amount: vec![to_cosm_coin(&coin)?],
        }
        .to_any()?;

        self.sign_and_broadcast(msg, fee, sequence).await
    }

    async fn execute_contract(
        &self,
        contract: &str,
        msg: &serde_json::Value,
        funds: Vec<Coin>,
        fee: &GasFee,
        sequence: u64,
    ) -> Result<String, ChainError> {
        let funds = funds
            .iter()
            .map(to_cosm_coin)
            .collect::<Result<Vec<_>, _>>()?;

        let msg = MsgExecuteContract {
            sender: self.account_id.clone(),
            contract: AccountId::from_str(contract)?,
            msg: serde_json::to_vec(msg)?,
            funds,
        }
        .to_any()?;

        self.sign_and_broadcast(msg, fee, sequence).await
    }

    async fn get_tx(&self, hash: &str) -> Result<Option<TxResult>, ChainError> {
        let response = TxServiceClient::new(self.query_channel.clone())
            .get_tx(GetTxRequest {
                hash: hash.to_owned(),
            })
            .await;

        let response = match response {
            Ok(response) => response.into_inner(),
            Err(status) if status.code() == tonic::Code::NotFound => return Ok(None),
            // Some nodes report unknown hashes as internal errors.
            Err(status) if status.message().contains("not found") => return Ok(None),
            Err(status) => return Err(status.into()),
        };

        Ok(response.tx_response.map(|tx| TxResult {
            hash: tx.txhash,
            height: tx.height,
            code: tx.code,
            raw_log: tx.raw_log,
        }))
    }
}

/// Builds [`GrpcChain`] clients from the chain configuration.
pub struct GrpcConnector {
    config: ChainConfig,
}

impl GrpcConnector {
    pub fn new(config: ChainConfig) -> Self {
        Self { config }
    }
}

#[async_trait]
impl ChainConnector for GrpcConnector {
    async fn connect(&self) -> Result<Arc<dyn ChainClient>, ChainError> {
        Ok(Arc::new(GrpcChain::connect(&self.config).await?))
    }
}

fn derive_key(mnemonic: &str) -> Result<SigningKey, ChainError> {
    let phrase = hkd32::mnemonic::Phrase::new(mnemonic.trim(), Default::default())
        .map_err(|_| ChainError::InvalidMnemonic)?;
    let seed = phrase.to_seed("");
    let path = cosmrs::bip32::DerivationPath::from_str(DERIVATION_PATH)
        .map_err(|_| ChainError::InvalidMnemonic)?;

    SigningKey::derive_from_path(seed.as_bytes(), &path).map_err(|_| ChainError::InvalidMnemonic)
}

fn to_cosm_coin(coin: &Coin) -> Result<cosmrs::Coin, cosmrs::ErrorReport> {
    Ok(cosmrs::Coin {
        denom: coin.denom.parse()?,
        amount: coin.amount,
    })
}

async fn query_base_account(channel: Channel, address: &str) -> Result<BaseAccount, ChainError> {
    let response = AuthQueryClient::new(channel)
        .account(QueryAccountRequest {
            address: address.to_owned(),
        })
        .await?
        .into_inner();

    let any = response.account.ok_or(ChainError::MissingAccount)?;

    Ok(BaseAccount::decode(any.value.as_slice())?)
}
